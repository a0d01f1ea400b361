// LAN peer core: secure transport, discovery, transfers, chat and updates.

pub mod bandwidth;
pub mod chat;
pub mod devices;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod notify;
pub mod policy;
pub mod pool;
pub mod transfer;
pub mod transport;
pub mod update;

pub use bandwidth::{run_adaptive_sampler, BandwidthGovernor, BandwidthMode};
pub use chat::{ChatConfig, ChatTransport};
pub use devices::{DeviceManager, Peer, ProbeConfig};
pub use discovery::{spawn_mdns, DiscoveryCommand, DiscoveryEvent, ServiceAdvert};
pub use dispatch::Dispatcher;
pub use error::{NetError, TransportError, TrustError};
pub use node::{Node, NodeOptions};
pub use notify::{Notification, Notifier};
pub use policy::{BlockKind, ContactPolicy, PolicyBook};
pub use transfer::{
    DeclineFiles, JobId, JobState, ReceiveConfirmer, TransferConfig, TransferEngine, TransferJob,
    TransferReport,
};
pub use transport::{Dialer, SecureListener, SecureStream, SecureTransport};
pub use update::{
    ExecutableInstaller, Installer, PackageSource, UpdateConfig, UpdateConfirmer,
    UpdateCoordinator, UpdateManifest, UpdateOutcome, UpdatePackage, UpdateState,
};
