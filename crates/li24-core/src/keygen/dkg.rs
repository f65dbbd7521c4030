//! Feldman VSS key generation rounds
//!
//! Fresh keygen and refresh run the same two rounds. A refresh starts from
//! an existing config, deals polynomials with a zero constant term and adds
//! the result onto the old shares, so the group key does not move.

use crate::math::{Commitment, Polynomial};
use crate::round::{Info, Message, Outbox};
use crate::types::Rid;
use crate::{Error, PartyId, Result, ThresholdConfig};
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{KeygenBroadcast, KeygenMessage, KeygenShare};

/// Deal a polynomial and send out shares, seeds and the commitment
pub struct Round1 {
    pub(super) previous: Option<ThresholdConfig>,
}

/// Collect and verify every other party's deal
pub struct Round2 {
    previous: Option<ThresholdConfig>,
    own_share: Scalar,
    commitments: BTreeMap<PartyId, Commitment>,
    chain_keys: BTreeMap<PartyId, Rid>,
    shares: BTreeMap<PartyId, Scalar>,
    /// Own seed contribution, XORed with the peer's once it arrives
    seeds: BTreeMap<PartyId, Rid>,
}

impl Round1 {
    pub(super) fn finalize(self, info: &Info, outbox: &mut Outbox<KeygenMessage>) -> Result<Round2> {
        let mut rng = OsRng;
        let constant = self.previous.as_ref().map(|_| Scalar::ZERO);
        let polynomial = Polynomial::random(&mut rng, info.threshold(), constant);
        let commitment = polynomial.commit();
        let chain_key = Rid::random(&mut rng);

        outbox.broadcast(KeygenMessage::Commitment(KeygenBroadcast {
            commitment: commitment.clone(),
            chain_key: chain_key.as_bytes().to_vec(),
        }));

        let mut seeds = BTreeMap::new();
        for id in info.other_party_ids() {
            let seed = Rid::random(&mut rng);
            outbox.send(
                id,
                KeygenMessage::Share(KeygenShare {
                    share: polynomial.evaluate_at(id),
                    seed: seed.as_bytes().to_vec(),
                }),
            );
            seeds.insert(id, seed);
        }

        let me = info.self_id();
        Ok(Round2 {
            previous: self.previous,
            own_share: polynomial.evaluate_at(me),
            commitments: BTreeMap::from([(me, commitment)]),
            chain_keys: BTreeMap::from([(me, chain_key)]),
            shares: BTreeMap::new(),
            seeds,
        })
    }
}

impl Round2 {
    fn is_refresh(&self) -> bool {
        self.previous.is_some()
    }

    pub(super) fn verify_message(&self, msg: &Message<KeygenMessage>) -> Result<()> {
        match &msg.content {
            KeygenMessage::Share(share) => Rid::from_slice(&share.seed)
                .map(|_| ())
                .map_err(|e| Error::invalid_message(msg.from, format!("seed: {}", e))),
            KeygenMessage::Commitment(_) => {
                Err(Error::invalid_message(msg.from, "commitment sent point-to-point"))
            }
        }
    }

    pub(super) fn store_message(&mut self, msg: Message<KeygenMessage>) -> Result<()> {
        let share = match msg.content {
            KeygenMessage::Share(share) => share,
            KeygenMessage::Commitment(_) => {
                return Err(Error::invalid_message(msg.from, "commitment sent point-to-point"))
            }
        };
        let seed = Rid::from_slice(&share.seed)
            .map_err(|e| Error::invalid_message(msg.from, format!("seed: {}", e)))?;
        let combined = self
            .seeds
            .get_mut(&msg.from)
            .ok_or_else(|| Error::invalid_message(msg.from, "no seed slot for sender"))?;
        combined.xor(&seed);
        self.shares.insert(msg.from, share.share);
        Ok(())
    }

    pub(super) fn store_broadcast_message(
        &mut self,
        info: &Info,
        msg: Message<KeygenMessage>,
    ) -> Result<()> {
        let broadcast = match msg.content {
            KeygenMessage::Commitment(broadcast) => broadcast,
            KeygenMessage::Share(_) => {
                return Err(Error::invalid_message(msg.from, "share sent as broadcast"))
            }
        };
        if broadcast.commitment.degree() != Some(info.threshold()) {
            return Err(Error::invalid_message(
                msg.from,
                format!(
                    "commitment degree {:?}, expected {}",
                    broadcast.commitment.degree(),
                    info.threshold()
                ),
            ));
        }
        if broadcast.commitment.has_zero_constant() != self.is_refresh() {
            return Err(Error::invalid_message(
                msg.from,
                "commitment disagrees on fresh keygen versus refresh",
            ));
        }
        let chain_key = Rid::from_slice(&broadcast.chain_key)
            .map_err(|e| Error::invalid_message(msg.from, format!("chain key: {}", e)))?;

        self.commitments.insert(msg.from, broadcast.commitment);
        self.chain_keys.insert(msg.from, chain_key);
        Ok(())
    }

    pub(super) fn finalize(self, info: &Info) -> Result<ThresholdConfig> {
        let me = info.self_id();
        let refresh = self.is_refresh();
        verify_shares(me, &self.shares, &self.commitments)?;

        let mut secret_share = self.shares.values().fold(self.own_share, |acc, s| acc + s);
        let summed = Commitment::sum(self.commitments.values())?;
        let mut public_shares: BTreeMap<PartyId, ProjectivePoint> = info
            .party_ids()
            .iter()
            .map(|id| (*id, summed.evaluate_at(*id)))
            .collect();

        let chain_key = match &self.previous {
            Some(previous) => {
                secret_share += previous.secret_share;
                for (id, point) in public_shares.iter_mut() {
                    let old = previous.public_shares.get(id).ok_or_else(|| {
                        Error::Internal(format!("Party {} missing from previous config", id))
                    })?;
                    *point += old;
                }
                previous.chain_key
            }
            None => self.chain_keys.values().fold(Rid::default(), |mut acc, key| {
                acc.xor(key);
                acc
            }),
        };

        let config = ThresholdConfig {
            curve: info.curve(),
            self_id: me,
            threshold: info.threshold(),
            secret_share,
            public_shares,
            rid_seeds: self.seeds,
            chain_key,
        };
        config.validate()?;

        info!(
            party_id = me,
            refresh,
            public_key = hex::encode(config.public_key_bytes()),
            "Keygen completed"
        );
        Ok(config)
    }
}

/// Feldman check of every received share against its sender's commitment
#[cfg(feature = "multi-thread")]
fn verify_shares(
    me: PartyId,
    shares: &BTreeMap<PartyId, Scalar>,
    commitments: &BTreeMap<PartyId, Commitment>,
) -> Result<()> {
    use rayon::prelude::*;

    let entries: Vec<(PartyId, Scalar)> = shares.iter().map(|(id, s)| (*id, *s)).collect();
    let invalid = entries
        .par_iter()
        .find_first(|(from, share)| !share_is_valid(me, *from, share, commitments));
    debug!(party_id = me, count = entries.len(), "Verified shares in parallel");
    match invalid {
        Some((from, _)) => Err(Error::ShareVerification { from: *from }),
        None => Ok(()),
    }
}

#[cfg(not(feature = "multi-thread"))]
fn verify_shares(
    me: PartyId,
    shares: &BTreeMap<PartyId, Scalar>,
    commitments: &BTreeMap<PartyId, Commitment>,
) -> Result<()> {
    for (from, share) in shares {
        if !share_is_valid(me, *from, share, commitments) {
            return Err(Error::ShareVerification { from: *from });
        }
    }
    debug!(party_id = me, count = shares.len(), "Verified shares");
    Ok(())
}

fn share_is_valid(
    me: PartyId,
    from: PartyId,
    share: &Scalar,
    commitments: &BTreeMap<PartyId, Commitment>,
) -> bool {
    commitments
        .get(&from)
        .map_or(false, |commitment| commitment.verify_share(me, share))
}
