//! Wiring of one running node.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::AbortHandle;
use tracing::info;

use lanshare_shared::crypto::MessageCipher;
use lanshare_shared::identity::Keystore;
use lanshare_shared::types::NodeId;
use lanshare_store::Journal;

use crate::bandwidth::{BandwidthGovernor, BandwidthMode};
use crate::chat::{ChatConfig, ChatTransport};
use crate::devices::{DeviceManager, ProbeConfig};
use crate::dispatch::Dispatcher;
use crate::error::NetError;
use crate::notify::Notifier;
use crate::policy::PolicyBook;
use crate::transfer::{DeclineFiles, ReceiveConfirmer, TransferConfig, TransferEngine};
use crate::transport::{Dialer, SecureTransport};
use crate::update::{
    DeclineThirdParty, ExecutableInstaller, Installer, UpdateConfig, UpdateConfirmer,
    UpdateCoordinator,
};

pub struct NodeOptions {
    pub node_id: NodeId,
    pub display_name: String,
    /// 0 picks a free port.
    pub port: u16,
    pub keystore: Keystore,
    pub journal: Journal,
    pub bandwidth: BandwidthMode,
    pub transfer: TransferConfig,
    pub chat: ChatConfig,
    pub probe: ProbeConfig,
    pub update: UpdateConfig,
    /// Defaults to the secure transport.
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Defaults to swapping the running executable.
    pub installer: Option<Arc<dyn Installer>>,
    pub confirmer: Arc<dyn UpdateConfirmer>,
    /// Asked about inbound files when auto-accept is off.
    pub receive_confirmer: Arc<dyn ReceiveConfirmer>,
}

impl NodeOptions {
    pub fn new(
        display_name: impl Into<String>,
        keystore: Keystore,
        journal: Journal,
        transfer: TransferConfig,
    ) -> Self {
        let update = UpdateConfig::new(transfer.staging_dir.join("updates"));
        Self {
            node_id: NodeId::new(),
            display_name: display_name.into(),
            port: 0,
            keystore,
            journal,
            bandwidth: BandwidthMode::default(),
            transfer,
            chat: ChatConfig::default(),
            probe: ProbeConfig::default(),
            update,
            dialer: None,
            installer: None,
            confirmer: Arc::new(DeclineThirdParty),
            receive_confirmer: Arc::new(DeclineFiles),
        }
    }
}

/// All components of a node, sharing one notifier and journal.
pub struct Node {
    pub notifier: Notifier,
    pub journal: Journal,
    pub devices: Arc<DeviceManager>,
    pub policies: Arc<PolicyBook>,
    pub governor: Arc<BandwidthGovernor>,
    pub transfers: Arc<TransferEngine>,
    pub chat: Arc<ChatTransport>,
    pub updates: Arc<UpdateCoordinator>,
    pub dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    accept: AbortHandle,
}

impl Node {
    /// Bind the secure listener and start accepting connections.
    pub async fn start(options: NodeOptions) -> Result<Self, NetError> {
        let notifier = Notifier::new();
        let journal = options.journal;
        let transport = SecureTransport::new(options.keystore.clone());
        let dialer: Arc<dyn Dialer> = match options.dialer {
            Some(dialer) => dialer,
            None => Arc::new(transport.clone()),
        };
        let installer: Arc<dyn Installer> = match options.installer {
            Some(installer) => installer,
            None => Arc::new(ExecutableInstaller::for_current_exe()?),
        };

        let listener = transport.listen(options.port).await?;
        let local_addr = listener.local_addr()?;

        let devices = Arc::new(DeviceManager::new(
            options.node_id,
            options.display_name,
            local_addr.port(),
            dialer.clone(),
            notifier.clone(),
            options.probe,
        ));
        let policies = Arc::new(PolicyBook::load(journal.clone())?);
        let governor = Arc::new(BandwidthGovernor::new(options.bandwidth));

        let transfers = Arc::new(TransferEngine::new(
            devices.clone(),
            dialer.clone(),
            journal.clone(),
            notifier.clone(),
            governor.clone(),
            options.receive_confirmer,
            options.transfer,
        ));
        let chat = Arc::new(ChatTransport::new(
            devices.clone(),
            dialer.clone(),
            MessageCipher::from_network_secret(&options.keystore.network_psk),
            journal.clone(),
            notifier.clone(),
            policies.clone(),
            options.chat,
        ));
        let updates = Arc::new(UpdateCoordinator::new(
            devices.clone(),
            dialer,
            journal.clone(),
            notifier.clone(),
            governor.clone(),
            installer,
            options.confirmer,
            options.update,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            devices.clone(),
            transfers.clone(),
            chat.clone(),
            updates.clone(),
            policies.clone(),
        ));
        let accept = tokio::spawn(dispatcher.clone().serve(listener)).abort_handle();

        info!(
            node = %options.node_id,
            addr = %local_addr,
            instance = %devices.instance_name(),
            "Node started"
        );

        Ok(Self {
            notifier,
            journal,
            devices,
            policies,
            governor,
            transfers,
            chat,
            updates,
            dispatcher,
            local_addr,
            accept,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.accept.abort();
        self.devices.shutdown();
        info!("Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
