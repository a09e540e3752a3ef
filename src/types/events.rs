use crate::types::chat::Chat;
use crate::types::connection::SessionState;
use crate::types::contact::Contact;
use crate::types::message::Message;
use log::warn;
use serde::Deserialize;

/// Closed set of push events the transport can deliver. Unknown event
/// names and malformed payloads are logged and dropped rather than
/// shape-sniffed.
#[derive(Debug, Clone)]
pub enum PushEvent {
    MessageNew {
        /// Present when the event also created or touched the chat.
        chat: Option<Chat>,
        message: Message,
    },
    MessageUpdate {
        message: Message,
    },
    ChatNew(Chat),
    ChatUpdate(Chat),
    ChatAutoClosed {
        chat_id: String,
    },
    ConnectionStatus {
        session_id: String,
        status: SessionState,
        qr: Option<String>,
        pairing_code: Option<String>,
    },
    ContactUpdated(Contact),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageNewPayload {
    #[serde(default)]
    chat: Option<Chat>,
    message: Message,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageUpdatePayload {
    message: Message,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoClosedPayload {
    chat_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatusPayload {
    session_id: String,
    status: SessionState,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    pairing_code: Option<String>,
}

impl PushEvent {
    /// Parses a raw push frame into its typed variant by event name.
    pub fn parse(name: &str, payload: serde_json::Value) -> Option<PushEvent> {
        let parsed = match name {
            "message:new" => serde_json::from_value::<MessageNewPayload>(payload)
                .map(|p| PushEvent::MessageNew {
                    chat: p.chat,
                    message: p.message,
                }),
            "message:update" => serde_json::from_value::<MessageUpdatePayload>(payload)
                .map(|p| PushEvent::MessageUpdate { message: p.message }),
            "chat:new" => serde_json::from_value::<Chat>(payload).map(PushEvent::ChatNew),
            "chat:update" => serde_json::from_value::<Chat>(payload).map(PushEvent::ChatUpdate),
            "chat:auto-closed" => serde_json::from_value::<AutoClosedPayload>(payload)
                .map(|p| PushEvent::ChatAutoClosed { chat_id: p.chat_id }),
            "whatsapp:status" => serde_json::from_value::<ConnectionStatusPayload>(payload)
                .map(|p| PushEvent::ConnectionStatus {
                    session_id: p.session_id,
                    status: p.status,
                    qr: p.qr,
                    pairing_code: p.pairing_code,
                }),
            "contact:updated" => {
                serde_json::from_value::<Contact>(payload).map(PushEvent::ContactUpdated)
            }
            other => {
                warn!(target: "Reconcile", "dropping unknown push event {other:?}");
                return None;
            }
        };

        match parsed {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(target: "Reconcile", "dropping malformed {name} payload: {e}");
                None
            }
        }
    }
}
