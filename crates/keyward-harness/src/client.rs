//! Simulated clients: crypto machines wired to a [`SimHomeserver`].

use std::time::Duration;

use keyward_core::{
    CryptoMachine, MachineConfig, MachineError, SyncReport, Transport,
    store::{MemoryStorage, Storage},
};
use keyward_crypto::{PickleKey, VodozemacSuite};
use keyward_proto::{DeviceId, UserId};

use crate::{
    sim_env::SimEnv,
    sim_homeserver::{SimHomeserver, SimTransport},
};

/// Fixed pickle key so every run pickles identically.
const PICKLE_KEY: [u8; 32] = [0x6b; 32];

/// Machine under test.
pub type TestMachine<S = MemoryStorage> = CryptoMachine<VodozemacSuite, SimTransport, S, SimEnv>;

/// Cipher suite with the harness pickle key.
pub fn suite() -> VodozemacSuite {
    VodozemacSuite::new(PickleKey::from_bytes(PICKLE_KEY))
}

/// Open (or reopen) a device's machine on `store` without touching the
/// network.
pub fn open_client<S: Storage>(
    server: &SimHomeserver,
    env: &SimEnv,
    store: S,
    user_id: &str,
    device_id: &str,
    config: MachineConfig,
) -> Result<TestMachine<S>, MachineError> {
    let (user_id, device_id) = (UserId::from(user_id), DeviceId::from(device_id));
    let transport = server.transport(&user_id, &device_id);
    CryptoMachine::open(store, suite(), transport, env.clone(), config, user_id, device_id)
}

/// Fresh in-memory device with its keys published.
pub async fn new_client(
    server: &SimHomeserver,
    env: &SimEnv,
    user_id: &str,
    device_id: &str,
) -> Result<TestMachine, MachineError> {
    let store = MemoryStorage::new();
    let mut machine =
        open_client(server, env, store, user_id, device_id, MachineConfig::default())?;
    machine.publish_keys().await?;
    Ok(machine)
}

/// Fetch and apply one sync batch.
pub async fn sync<S: Storage>(machine: &mut TestMachine<S>) -> Result<SyncReport, MachineError> {
    let since = machine.sync_token().map(str::to_owned);
    let response = machine.transport().sync(since.as_deref(), Duration::ZERO).await?;
    machine.process_sync(response).await
}
