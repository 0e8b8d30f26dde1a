use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use wsrelay::prelude::*;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Say {
    text: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Notice {
    Welcome { you: SessionId, members: usize },
    Joined { id: SessionId },
    Said { from: SessionId, text: String },
    Left { id: SessionId },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// One chat room per upgrade path. Text messages of the form
/// `{"text": "..."}` are relayed to everyone else on the same path.
struct Chat {
    registry: SessionRegistry,
    rooms: Mutex<HashMap<String, HashSet<SessionId>>>,
}

impl Chat {
    fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Returns every member of `path` except `except`.
    fn others(&self, path: &str, except: &SessionId) -> Vec<SessionId> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .get(path)
            .map(|members| {
                members.iter().filter(|id| *id != except).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&self, to: &[SessionId], notice: &Notice) {
        let Ok(json) = serde_json::to_string(notice) else {
            return;
        };
        let delivered = self.registry.send_to(to, json.into_bytes(), MessageKind::Text);
        tracing::trace!(targets = to.len(), delivered, "chat broadcast");
    }

    fn leave(&self, path: &str, id: &SessionId) {
        let was_member = {
            let mut rooms =
                self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(members) = rooms.get_mut(path) else {
                return;
            };
            let removed = members.remove(id);
            if members.is_empty() {
                rooms.remove(path);
            }
            removed
        };
        // A session whose upgrade failed never joined.
        if was_member {
            self.broadcast(&self.others(path, id), &Notice::Left { id: id.clone() });
        }
    }
}

impl Router for Chat {
    fn dispatch_open(&self, path: &str, ctx: OpenContext<'_>) {
        let id = ctx.session.id().clone();
        let members = {
            let mut rooms =
                self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            let members = rooms.entry(path.to_string()).or_default();
            members.insert(id.clone());
            members.len()
        };

        if let Ok(json) = serde_json::to_string(&Notice::Welcome {
            you: id.clone(),
            members,
        }) {
            let _ = ctx.session.send_text(&json);
        }
        self.broadcast(&self.others(path, &id), &Notice::Joined { id });
    }

    fn dispatch_message(&self, path: &str, ctx: MessageContext<'_>) {
        let Some(Ok(say)) = ctx.text().map(serde_json::from_str::<Say>) else {
            tracing::debug!(id = %ctx.session.id(), "ignoring non-chat message");
            return;
        };
        let from = ctx.session.id().clone();
        self.broadcast(
            &self.others(path, &from),
            &Notice::Said {
                from,
                text: say.text,
            },
        );
    }

    fn dispatch_error(&self, path: &str, ctx: ErrorContext<'_>) {
        self.leave(path, ctx.session.id());
    }

    fn dispatch_close(&self, path: &str, ctx: CloseContext<'_>) {
        self.leave(path, ctx.session.id());
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    wsrelay::init_tracing("chat=info,wsrelay_session=info,warn");

    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WSRELAY_ADDR").ok())
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    tracing::info!(%addr, "starting chat server");

    let registry = SessionRegistry::global().clone();
    let server = WsRelayServer::builder()
        .bind(&addr)
        .server_name("wsrelay-chat")
        .registry(registry.clone())
        .build(Chat::new(registry))
        .await?;

    server.run().await?;
    Ok(())
}
