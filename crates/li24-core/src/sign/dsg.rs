//! Signing rounds
//!
//! Signers hold Lagrange-scaled additive shares wᵢ of the key. Each pair of
//! signers shares a PRG chain; the pads drawn from it are added by the
//! lower id and subtracted by the higher one, so masked values still sum to
//! the true ones. Masked (k, φ, w) triples travel in one direction per
//! pair, which is enough for every signer to hold an additive share of
//! k·φ and of w·φ after a single exchange.

use crate::prg::Prg;
use crate::round::{Info, Message, Outbox};
use crate::types::{hash_to_scalar, x_coordinate};
use crate::{Error, PartyId, Result, Signature, ThresholdConfig};
use elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{MaskedShares, NonceCommitment, PartialSignature, SignMessage, SignOutput};

/// Number of co-signers a signer at `index` of `n` reveals its masked
/// triple to
///
/// The recipients are the next `count` signers in cyclic order. With an
/// even number of co-signers everyone reveals to half of them; otherwise
/// the lower half of the list takes the extra antipodal partner.
pub fn reveal_count(index: usize, n: usize) -> usize {
    let others = n.saturating_sub(1);
    if others % 2 == 0 {
        others / 2
    } else if index < n / 2 {
        n / 2
    } else {
        n / 2 - 1
    }
}

/// Whether the signer at `from` sends real values to the signer at `to`
pub fn reveals_to(from: usize, to: usize, n: usize) -> bool {
    let offset = (to + n - from) % n;
    offset >= 1 && offset <= reveal_count(from, n)
}

/// Session-wide state carried through all three rounds
pub(super) struct Context {
    /// Unscaled input config; the ratchet base for the output
    pub(super) config: ThresholdConfig,
    pub(super) message: Vec<u8>,
    pub(super) public_key: ProjectivePoint,
    pub(super) prg: Prg,
}

/// Mask the nonce, blinding and key shares and fan them out
pub struct Round1 {
    pub(super) ctx: Context,
    /// λᵢ·xᵢ
    pub(super) w: Scalar,
}

/// Combine received triples into shares of k·φ and w·φ
pub struct Round2 {
    ctx: Context,
    k: Scalar,
    phi: Scalar,
    w: Scalar,
    gammas: BTreeMap<PartyId, ProjectivePoint>,
    masked: BTreeMap<PartyId, MaskedShares>,
}

/// Sum the partials, invert and verify
pub struct Round3 {
    ctx: Context,
    big_r: ProjectivePoint,
    partials: BTreeMap<PartyId, PartialSignature>,
}

impl Round1 {
    pub(super) fn finalize(mut self, info: &Info, outbox: &mut Outbox<SignMessage>) -> Result<Round2> {
        let mut rng = OsRng;
        let me = info.self_id();
        let mut k = Scalar::random(&mut rng);
        let mut phi = Scalar::random(&mut rng);
        let mut w = self.w;

        // pads are drawn k, φ, w per peer on both ends of a chain
        for peer in info.other_party_ids() {
            let pad_k = self.ctx.prg.next(peer)?;
            let pad_phi = self.ctx.prg.next(peer)?;
            let pad_w = self.ctx.prg.next(peer)?;
            if peer > me {
                k += pad_k;
                phi += pad_phi;
                w += pad_w;
            } else {
                k -= pad_k;
                phi -= pad_phi;
                w -= pad_w;
            }
        }

        let gamma = ProjectivePoint::GENERATOR * k;
        outbox.broadcast(SignMessage::Nonce(NonceCommitment { gamma }));

        let ids = info.party_ids();
        let n = ids.len();
        let index = info
            .index_of(me)
            .ok_or_else(|| Error::Internal("Self missing from signer list".into()))?;
        let count = reveal_count(index, n);
        for i in 1..n {
            let to = ids[(index + i) % n];
            let shares = if i <= count {
                MaskedShares { k, phi, w }
            } else {
                MaskedShares::zero()
            };
            outbox.send(to, SignMessage::Masked(shares));
        }
        debug!(party_id = me, revealed = count, "Masked shares sent");

        Ok(Round2 {
            ctx: self.ctx,
            k,
            phi,
            w,
            gammas: BTreeMap::from([(me, gamma)]),
            masked: BTreeMap::new(),
        })
    }
}

impl Round2 {
    pub(super) fn verify_message(&self, info: &Info, msg: &Message<SignMessage>) -> Result<()> {
        let shares = match &msg.content {
            SignMessage::Masked(shares) => shares,
            _ => return Err(Error::invalid_message(msg.from, "expected masked shares")),
        };
        let (from, to) = match (info.index_of(msg.from), info.index_of(info.self_id())) {
            (Some(from), Some(to)) => (from, to),
            _ => return Err(Error::invalid_message(msg.from, "sender is not a signer")),
        };
        match (reveals_to(from, to, info.n()), shares.is_zero()) {
            (true, true) => Err(Error::invalid_message(msg.from, "missing masked shares")),
            (false, false) => Err(Error::invalid_message(msg.from, "expected a zero triple")),
            _ => Ok(()),
        }
    }

    pub(super) fn store_message(&mut self, msg: Message<SignMessage>) -> Result<()> {
        match msg.content {
            SignMessage::Masked(shares) => {
                self.masked.insert(msg.from, shares);
                Ok(())
            }
            _ => Err(Error::invalid_message(msg.from, "expected masked shares")),
        }
    }

    pub(super) fn store_broadcast_message(&mut self, msg: Message<SignMessage>) -> Result<()> {
        match msg.content {
            SignMessage::Nonce(nonce) => {
                self.gammas.insert(msg.from, nonce.gamma);
                Ok(())
            }
            _ => Err(Error::invalid_message(msg.from, "expected a nonce commitment")),
        }
    }

    pub(super) fn finalize(self, info: &Info, outbox: &mut Outbox<SignMessage>) -> Result<Round3> {
        let big_r = self
            .gammas
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, gamma| acc + gamma);
        let r = x_coordinate(&big_r)
            .ok_or_else(|| Error::Crypto("Aggregate nonce is the identity".into()))?;

        let mut u = self.w * self.phi;
        let mut v = self.k * self.phi;
        for shares in self.masked.values() {
            u += self.w * shares.phi + self.phi * shares.w;
            v += self.k * shares.phi + self.phi * shares.k;
        }
        let delta = hash_to_scalar(&self.ctx.message) * self.phi + r * u;

        let partial = PartialSignature { v, delta };
        outbox.broadcast(SignMessage::Partial(partial.clone()));

        Ok(Round3 {
            ctx: self.ctx,
            big_r,
            partials: BTreeMap::from([(info.self_id(), partial)]),
        })
    }
}

impl Round3 {
    pub(super) fn store_broadcast_message(&mut self, msg: Message<SignMessage>) -> Result<()> {
        match msg.content {
            SignMessage::Partial(partial) => {
                self.partials.insert(msg.from, partial);
                Ok(())
            }
            _ => Err(Error::invalid_message(msg.from, "expected a partial signature")),
        }
    }

    pub(super) fn finalize(self, info: &Info) -> Result<SignOutput> {
        let (v, delta) = self
            .partials
            .values()
            .fold((Scalar::ZERO, Scalar::ZERO), |(v, delta), p| {
                (v + p.v, delta + p.delta)
            });
        let v_inv = Option::<Scalar>::from(v.invert()).ok_or(Error::SignatureVerification)?;
        let signature =
            Signature::new(self.big_r, delta * v_inv).map_err(|_| Error::SignatureVerification)?;
        if !signature.verify(&self.ctx.public_key, &self.ctx.message) {
            return Err(Error::SignatureVerification);
        }

        let mut config = self.ctx.config.clone();
        self.ctx.prg.ratchet(&mut config.rid_seeds);

        info!(
            party_id = info.self_id(),
            signers = ?info.party_ids(),
            signature = hex::encode(signature.to_bytes()),
            "Signing completed"
        );
        Ok(SignOutput { signature, config })
    }
}
