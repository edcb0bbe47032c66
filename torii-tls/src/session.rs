//! Session resumption state: the server-side session cache and the
//! per-process ticket keys.

use std::collections::HashMap;
use std::fmt;

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use aws_lc_rs::rand::{SecureRandom as _, SystemRandom};
use parking_lot::Mutex;

/// Server-side session store keyed by the session id's hex form.
///
/// Shared across workers behind one lock; entries are small serialized
/// session blobs.
#[derive(Debug, Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl SessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl rustls::server::StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let id = hex::encode(&key);
        tracing::debug!(session_id = %id, "caching tls session");
        self.sessions.lock().insert(id, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let id = hex::encode(key);
        let found = self.sessions.lock().get(&id).cloned();
        if found.is_some() {
            tracing::trace!(session_id = %id, "tls session cache hit");
        }
        found
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let id = hex::encode(key);
        let taken = self.sessions.lock().remove(&id);
        if taken.is_some() {
            tracing::trace!(session_id = %id, "tls session taken");
        }
        taken
    }

    fn can_cache(&self) -> bool {
        true
    }
}

/// Per-process ticket keys: a public key name plus the AES key and
/// HMAC-style secret bound into the sealed ticket. Seeded once at
/// startup; tickets from another key generation are rejected by the
/// key-name prefix.
pub struct TicketKeys {
    key_name: [u8; 16],
    aes_key: [u8; 16],
    hmac_secret: [u8; 16],
    rng: SystemRandom,
}

impl TicketKeys {
    /// Seeds a fresh key set from the system RNG.
    pub fn generate() -> Result<Self, rustls::Error> {
        let rng = SystemRandom::new();
        let mut key_name = [0u8; 16];
        let mut aes_key = [0u8; 16];
        let mut hmac_secret = [0u8; 16];
        for slot in [&mut key_name, &mut aes_key, &mut hmac_secret] {
            rng.fill(slot)
                .map_err(|_| rustls::Error::FailedToGetRandomBytes)?;
        }
        Ok(Self {
            key_name,
            aes_key,
            hmac_secret,
            rng,
        })
    }

    fn sealing_key(&self) -> Option<LessSafeKey> {
        UnboundKey::new(&AES_128_GCM, &self.aes_key)
            .ok()
            .map(LessSafeKey::new)
    }
}

impl rustls::server::ProducesTickets for TicketKeys {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        // Half a day, matching the session cache expectation.
        12 * 60 * 60
    }

    /// Ticket layout: `key_name[16] || nonce[12] || aead(ciphertext)`.
    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).ok()?;

        let mut sealed = plain.to_vec();
        self.sealing_key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(self.hmac_secret),
                &mut sealed,
            )
            .ok()?;

        let mut ticket = Vec::with_capacity(16 + NONCE_LEN + sealed.len());
        ticket.extend_from_slice(&self.key_name);
        ticket.extend_from_slice(&nonce_bytes);
        ticket.extend_from_slice(&sealed);
        tracing::trace!(len = ticket.len(), "issued tls session ticket");
        Some(ticket)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        let (name, rest) = cipher.split_at_checked(16)?;
        if name != self.key_name {
            tracing::debug!("rejecting ticket with a foreign key name");
            return None;
        }
        let (nonce_bytes, sealed) = rest.split_at_checked(NONCE_LEN)?;
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).ok()?;

        let mut opened = sealed.to_vec();
        let plain_len = self
            .sealing_key()?
            .open_in_place(nonce, Aad::from(self.hmac_secret), &mut opened)
            .ok()?
            .len();
        opened.truncate(plain_len);
        tracing::trace!("accepted tls session ticket");
        Some(opened)
    }
}

impl fmt::Debug for TicketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs; the key name is public.
        f.debug_struct("TicketKeys")
            .field("key_name", &hex::encode(self.key_name))
            .finish()
    }
}
