//! Chaotic storage wrapper for fault injection testing
//!
//! Wraps another backend and fails calls at a configured rate, so tests can
//! check that a failed write surfaces as an error and never leaves the
//! in-memory state ahead of what a restart would load.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use keyward_proto::{Algorithm, DeviceId, Membership, RoomId, SessionId, UserId};

use super::{AccountRecord, DeviceRecord, Storage, StorageError, StoredState, UserRecord};
use crate::index::Triplet;

/// Storage wrapper that randomly injects I/O failures.
///
/// The failure rate can be changed at runtime, which lets a test run a burst
/// of chaos and then let the system recover against the same underlying data.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    chaos: Arc<Mutex<Chaos>>,
}

struct Chaos {
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: ChaoticRng,
    operations: usize,
    injected: usize,
}

/// Linear congruential generator, reproducible per seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

fn check_rate(failure_rate: f64) {
    assert!(
        (0.0..=1.0).contains(&failure_rate),
        "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
    );
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        check_rate(failure_rate);
        let chaos = Chaos { failure_rate, rng: ChaoticRng::new(seed), operations: 0, injected: 0 };
        Self { inner, chaos: Arc::new(Mutex::new(chaos)) }
    }

    /// Underlying storage, for checking state after chaos.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Change the failure rate for all clones.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        check_rate(failure_rate);
        self.lock().failure_rate = failure_rate;
    }

    /// Total number of storage calls attempted.
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }

    /// Number of calls that were failed on purpose.
    pub fn injected_failures(&self) -> usize {
        self.lock().injected
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Chaos> {
        self.chaos.lock().expect("Chaos mutex poisoned")
    }

    /// Count the call and decide whether it fails.
    fn roll(&self) -> Result<(), StorageError> {
        let mut chaos = self.lock();
        chaos.operations += 1;
        let failure_rate = chaos.failure_rate;
        if chaos.rng.next() < failure_rate {
            chaos.injected += 1;
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn store_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        account: &AccountRecord,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_account(user_id, device_id, account)
    }

    fn mark_keys_published(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.mark_keys_published(user_id, device_id)
    }

    fn store_sync_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        token: &str,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_sync_token(user_id, device_id, token)
    }

    fn store_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_megolm_out(user_id, device_id, room_id, pickle)
    }

    fn remove_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.remove_megolm_out(user_id, device_id, room_id)
    }

    fn store_user(&self, user_id: &UserId, record: &UserRecord) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_user(user_id, record)
    }

    fn store_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: &DeviceRecord,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_device(user_id, device_id, keys)
    }

    fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_olm_session(user_id, device_id, session_id, pickle)
    }

    fn store_megolm_in(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_megolm_in(user_id, device_id, session_id, pickle)
    }

    fn mark_megolm_shared(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.mark_megolm_shared(user_id, device_id, session_id)
    }

    fn store_olm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_olm_session_id(triplet, session_id)
    }

    fn store_megolm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_megolm_session_id(triplet, session_id)
    }

    fn store_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_room_algorithm(room_id, algorithm)
    }

    fn store_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.store_membership(room_id, user_id, membership)
    }

    fn load(&self, user_id: &UserId, device_id: &DeviceId) -> Result<StoredState, StorageError> {
        self.roll()?;
        self.inner.load(user_id, device_id)
    }
}
