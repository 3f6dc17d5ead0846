//! Ownership of the live card connection.

use crate::domain::error::{CardError, Result};
use crate::domain::models::{CardEvent, ConnectionStatus};
use crate::domain::settings::{ConnectionPolicy, Settings};
use crate::infrastructure::protocol::{FrameCodec, Multiplexer, TransferProgress};
use crate::infrastructure::serial::Connector;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Holds at most one multiplexer over the transport produced by `C`.
pub struct CardSession<C: Connector> {
    connector: C,
    mux: Option<Multiplexer<C::Transport>>,
    policy: ConnectionPolicy,
    codec: FrameCodec,
    upload_delay: Duration,
    progress: TransferProgress,
    event_tx: Option<mpsc::UnboundedSender<CardEvent>>,
}

impl<C: Connector> CardSession<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            mux: None,
            policy: ConnectionPolicy::default(),
            codec: FrameCodec::default(),
            upload_delay: crate::infrastructure::protocol::multiplexer::DEFAULT_UPLOAD_DELAY,
            progress: TransferProgress::default(),
            event_tx: None,
        }
    }

    pub fn from_settings(connector: C, settings: &Settings) -> Self {
        Self::new(connector)
            .with_policy(settings.connection_policy)
            .with_codec(FrameCodec::new(settings.strict_checksum))
            .with_upload_delay(settings.upload_delay())
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<CardEvent>) -> Self {
        self.set_events(event_tx);
        self
    }

    pub fn set_events(&mut self, event_tx: mpsc::UnboundedSender<CardEvent>) {
        self.event_tx = Some(event_tx);
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// Byte counter of the transfer in flight; survives reconnects.
    pub fn progress(&self) -> TransferProgress {
        self.progress.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.mux.as_ref().is_some_and(|m| m.is_open())
    }

    /// Open the transport unless a live multiplexer already exists.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.mux = None;

        info!("Connecting to {}", self.connector.describe());
        self.emit(CardEvent::ConnectionStatus(ConnectionStatus::Connecting));
        match self.connector.connect() {
            Ok(transport) => {
                self.mux = Some(
                    Multiplexer::new(transport)
                        .with_codec(self.codec)
                        .with_upload_delay(self.upload_delay)
                        .with_progress(self.progress.clone()),
                );
                info!("Connected to {}", self.connector.describe());
                self.emit(CardEvent::ConnectionStatus(ConnectionStatus::Connected));
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                self.emit(CardEvent::ConnectionStatus(ConnectionStatus::Error));
                Err(e)
            }
        }
    }

    /// Close the link. Does nothing when already closed.
    pub fn disconnect(&mut self) {
        let Some(mut mux) = self.mux.take() else {
            return;
        };
        mux.cleanup();
        self.connector.disconnect();
        info!("Disconnected from card");
        self.emit(CardEvent::ConnectionStatus(ConnectionStatus::Disconnected));
    }

    /// Run `op` against the live multiplexer. Transport failures tear the
    /// connection down before the error is returned.
    pub fn with_mux<R>(
        &mut self,
        op: impl FnOnce(&mut Multiplexer<C::Transport>) -> Result<R>,
    ) -> Result<R> {
        let mux = self.mux.as_mut().ok_or(CardError::NotConnected)?;
        let result = op(mux);
        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Transport failure, tearing down connection: {}", e);
                self.disconnect();
            }
        }
        result
    }

    /// Connect if needed, run `op`, then drop the link when the policy says
    /// each call gets its own connection.
    pub fn run<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.connect()?;
        let result = op(self);
        if self.policy == ConnectionPolicy::ReconnectPerCall {
            debug!("Closing per-call connection");
            self.disconnect();
        }
        result
    }

    pub(crate) fn emit(&self, event: CardEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl<C: Connector> Drop for CardSession<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
