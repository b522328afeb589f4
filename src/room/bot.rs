//! Data channel bot: every peer gets a data consumer for the bot's producer,
//! and text a peer sends on its own `bot` data producer is echoed back.

use super::Peer;
use crate::engine::{
    DataConsumeOptions, DataConsumerEvent, DataProduceOptions, DataProducer, Router, Transport,
};
use crate::error::RoomResult;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub const BOT_LABEL: &str = "bot";

pub struct Bot {
    transport: Arc<dyn Transport>,
    data_producer: Arc<dyn DataProducer>,
}

impl Bot {
    pub async fn create(router: &Arc<dyn Router>) -> RoomResult<Self> {
        let transport = router.create_direct_transport().await?;

        let data_producer = match transport
            .produce_data(DataProduceOptions {
                label: BOT_LABEL.to_string(),
                ..DataProduceOptions::default()
            })
            .await
        {
            Ok(data_producer) => data_producer,
            Err(err) => {
                transport.close();
                return Err(err.into());
            }
        };

        Ok(Self {
            transport,
            data_producer,
        })
    }

    pub fn data_producer(&self) -> &Arc<dyn DataProducer> {
        &self.data_producer
    }

    /// Consumes the peer's `bot` data producer and answers each text message.
    pub async fn handle_peer_data_producer(
        &self,
        data_producer_id: &str,
        peer: &Arc<Peer>,
    ) -> RoomResult<()> {
        let data_consumer = self
            .transport
            .consume_data(DataConsumeOptions {
                data_producer_id: data_producer_id.to_string(),
            })
            .await?;

        let mut events = data_consumer.subscribe();
        let reply_to = Arc::clone(&self.data_producer);
        let peer = Arc::downgrade(peer);

        tokio::spawn(async move {
            let _data_consumer = data_consumer;
            loop {
                let message = match events.recv().await {
                    Ok(DataConsumerEvent::Message(message)) => message,
                    Ok(_) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                };

                let Some(text) = message.text() else {
                    warn!("bot ignoring non text message (ppid {})", message.ppid);
                    continue;
                };
                let Some(peer) = peer.upgrade() else { break };
                let display_name = peer.profile().display_name.unwrap_or_default();

                debug!("bot received \"{}\" from {}", text, peer.id());
                if let Err(err) = reply_to
                    .send_text(&format!("{display_name} said me: \"{text}\""))
                    .await
                {
                    warn!("bot reply failed: {}", err);
                }
            }
        });

        Ok(())
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
