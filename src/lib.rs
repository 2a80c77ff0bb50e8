// bluemesh-core: BLE mesh protocol engine
//
// Bridges an upper mesh stack to Bluetooth Low Energy transport: discovers
// peers by service UUID, decides which side dials, exchanges 16-byte
// identities that survive MAC rotation, and fragments packets across the
// negotiated MTU. The platform Bluetooth stack and the mesh layer above
// stay behind the driver and host contracts.

pub mod config;
pub mod driver;
pub mod engine;
pub mod host;
pub mod identity;
pub mod link;
pub mod peer;
pub mod wire;

pub use config::{EngineConfig, PowerMode};
pub use driver::{Advertisement, BleDriver, DriverError, DriverEvent, GattProfile};
pub use engine::{Engine, EngineError, EngineHandle};
pub use host::{MeshHost, PeerHandle};
pub use identity::{Identity, MacAddress};
