//! Dealer request → typed command translation.
//!
//! Subscribes to [`crate::dealer::DealerSession::subscribe_requests`],
//! filters on the `hm://connect-state/v1/` `message_ident` prefix, decodes
//! each request's JSON payload into a [`Command`], broadcasts the result,
//! and always replies to the dealer — `success=true` once the command
//! decoded and was broadcast, `success=false` for an unrecognized endpoint
//! or a malformed payload.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::dealer::DealerSession;
use crate::protocol_constants::COMMAND_CHANNEL_CAPACITY;
use crate::runtime::TaskSpawner;

const ENDPOINT_PREFIX: &str = "hm://connect-state/v1/";

/// Shuffle/repeat options optionally carried by a `play` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayOptions {
    pub shuffling_context: Option<bool>,
    pub repeating_context: Option<bool>,
    pub repeating_track: Option<bool>,
}

/// A single queued track reference, as carried by `set_queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTrack {
    pub uri: String,
}

/// A typed remote-control command, decoded from a dealer request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play {
        context_uri: Option<String>,
        track_uri: Option<String>,
        seek_to_ms: Option<u64>,
        skip_to_track_index: Option<u32>,
        options: PlayOptions,
    },
    Pause,
    Resume,
    Seek {
        position_ms: u64,
    },
    SkipNext,
    SkipPrev,
    Shuffle {
        value: bool,
    },
    RepeatContext {
        value: bool,
    },
    RepeatTrack {
        value: bool,
    },
    /// `transfer_state` is an opaque protobuf blob this crate does not
    /// decode; callers load from `PlaybackState`'s last-known cluster
    /// player state instead of inspecting these bytes.
    Transfer {
        transfer_state: Vec<u8>,
    },
    SetQueue {
        next_tracks: Vec<QueuedTrack>,
    },
    AddToQueue {
        track_uri: String,
    },
}

/// A decoded command plus the dealer correlation fields needed to reply.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub command: Command,
    pub endpoint: String,
    pub message_ident: String,
    pub message_id: u64,
    pub sender_device_id: String,
    pub key: String,
}

/// Errors decoding a request payload into a [`Command`]. Both variants
/// produce a `success=false` reply; neither is fatal to the handler loop.
#[derive(Debug, thiserror::Error)]
enum CommandParseError {
    #[error("device does not support command {0:?}")]
    UnsupportedEndpoint(String),

    #[error("malformed payload for {endpoint:?}: {reason}")]
    MalformedPayload { endpoint: String, reason: String },
}

/// Decodes a request's JSON payload into a [`Command`] given the endpoint
/// suffix (the part of `message_ident` after [`ENDPOINT_PREFIX`]).
fn parse_command(endpoint: &str, payload: &serde_json::Value) -> Result<Command, CommandParseError> {
    let malformed = |reason: String| CommandParseError::MalformedPayload {
        endpoint: endpoint.to_string(),
        reason,
    };

    match endpoint {
        "play" => {
            #[derive(Deserialize, Default)]
            #[serde(default)]
            struct Track {
                uri: Option<String>,
            }
            #[derive(Deserialize, Default)]
            #[serde(default)]
            struct SkipTo {
                track_index: Option<u32>,
            }
            #[derive(Deserialize, Default)]
            #[serde(default)]
            struct Options {
                shuffling_context: Option<bool>,
                repeating_context: Option<bool>,
                repeating_track: Option<bool>,
            }
            #[derive(Deserialize, Default)]
            #[serde(default)]
            struct PlayPayload {
                context_uri: Option<String>,
                track: Track,
                seek_to: Option<u64>,
                skip_to: SkipTo,
                options: Option<Options>,
            }

            let decoded: PlayPayload =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
            let options = decoded.options.unwrap_or_default();
            Ok(Command::Play {
                context_uri: decoded.context_uri,
                track_uri: decoded.track.uri,
                seek_to_ms: decoded.seek_to,
                skip_to_track_index: decoded.skip_to.track_index,
                options: PlayOptions {
                    shuffling_context: options.shuffling_context,
                    repeating_context: options.repeating_context,
                    repeating_track: options.repeating_track,
                },
            })
        }
        "pause" => Ok(Command::Pause),
        "resume" => Ok(Command::Resume),
        "seek_to" => {
            #[derive(Deserialize)]
            struct SeekPayload {
                position: u64,
            }
            let decoded: SeekPayload =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
            Ok(Command::Seek { position_ms: decoded.position })
        }
        "skip_next" => Ok(Command::SkipNext),
        "skip_prev" => Ok(Command::SkipPrev),
        "set_shuffling_context" => Ok(Command::Shuffle { value: bool_value(payload).map_err(malformed)? }),
        "set_repeating_context" => Ok(Command::RepeatContext { value: bool_value(payload).map_err(malformed)? }),
        "set_repeating_track" => Ok(Command::RepeatTrack { value: bool_value(payload).map_err(malformed)? }),
        "transfer" => {
            #[derive(Deserialize)]
            struct TransferPayload {
                transfer_state: String,
            }
            let decoded: TransferPayload =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &decoded.transfer_state)
                .map_err(|e| malformed(e.to_string()))?;
            Ok(Command::Transfer { transfer_state: bytes })
        }
        "set_queue" => {
            #[derive(Deserialize)]
            struct QueueEntry {
                uri: String,
            }
            #[derive(Deserialize)]
            struct SetQueuePayload {
                next_tracks: Vec<QueueEntry>,
            }
            let decoded: SetQueuePayload =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
            Ok(Command::SetQueue {
                next_tracks: decoded.next_tracks.into_iter().map(|t| QueuedTrack { uri: t.uri }).collect(),
            })
        }
        "add_to_queue" => {
            #[derive(Deserialize)]
            struct AddToQueuePayload {
                track_uri: String,
            }
            let decoded: AddToQueuePayload =
                serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
            Ok(Command::AddToQueue { track_uri: decoded.track_uri })
        }
        other => Err(CommandParseError::UnsupportedEndpoint(other.to_string())),
    }
}

fn bool_value(payload: &serde_json::Value) -> Result<bool, String> {
    #[derive(Deserialize)]
    struct BoolPayload {
        value: bool,
    }
    serde_json::from_value::<BoolPayload>(payload.clone())
        .map(|p| p.value)
        .map_err(|e| e.to_string())
}

/// Subscribes to the dealer's request stream and translates it into typed
/// [`CommandEnvelope`]s, replying to every request it sees.
pub struct CommandHandler {
    tx: broadcast::Sender<CommandEnvelope>,
}

impl CommandHandler {
    /// Spawns the handler loop on `spawner` and returns a handle.
    pub fn start(dealer: Arc<DealerSession>, spawner: &dyn TaskSpawner) -> Arc<Self> {
        let (tx, _) = broadcast::channel(COMMAND_CHANNEL_CAPACITY);
        let handler = Arc::new(Self { tx });

        let loop_handler = handler.clone();
        spawner.spawn(async move {
            loop_handler.run(dealer).await;
        });

        handler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommandEnvelope> {
        self.tx.subscribe()
    }

    async fn run(&self, dealer: Arc<DealerSession>) {
        let mut requests = dealer.subscribe_requests();
        loop {
            let request = match requests.recv().await {
                Ok(request) => request,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("command_handler: request stream lagged by {n} frames");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let Some(endpoint) = request.message_ident.strip_prefix(ENDPOINT_PREFIX) else {
                continue;
            };

            match parse_command(endpoint, &request.payload) {
                Ok(command) => {
                    let envelope = CommandEnvelope {
                        command,
                        endpoint: endpoint.to_string(),
                        message_ident: request.message_ident.clone(),
                        message_id: request.message_id,
                        sender_device_id: request.sender_device_id.clone(),
                        key: request.key.clone(),
                    };
                    let _ = self.tx.send(envelope);
                    if let Err(e) = dealer.send_reply(&request.key, true).await {
                        log::warn!("command_handler: failed to send reply for {endpoint:?}: {e}");
                    }
                }
                Err(e) => {
                    log::warn!("command_handler: {e}");
                    if let Err(e) = dealer.send_reply(&request.key, false).await {
                        log::warn!("command_handler: failed to send failure reply: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_full_payload() {
        let payload = serde_json::json!({
            "context_uri": "spotify:album:abc",
            "track": { "uri": "spotify:track:def" },
            "seek_to": 1500,
            "skip_to": { "track_index": 2 },
            "options": { "shuffling_context": true, "repeating_context": false, "repeating_track": null },
        });
        let command = parse_command("play", &payload).unwrap();
        assert_eq!(
            command,
            Command::Play {
                context_uri: Some("spotify:album:abc".to_string()),
                track_uri: Some("spotify:track:def".to_string()),
                seek_to_ms: Some(1500),
                skip_to_track_index: Some(2),
                options: PlayOptions {
                    shuffling_context: Some(true),
                    repeating_context: Some(false),
                    repeating_track: None,
                },
            }
        );
    }

    #[test]
    fn parses_play_with_minimal_payload() {
        let command = parse_command("play", &serde_json::json!({})).unwrap();
        assert_eq!(
            command,
            Command::Play {
                context_uri: None,
                track_uri: None,
                seek_to_ms: None,
                skip_to_track_index: None,
                options: PlayOptions::default(),
            }
        );
    }

    #[test]
    fn parses_argumentless_commands() {
        assert_eq!(parse_command("pause", &serde_json::json!({})).unwrap(), Command::Pause);
        assert_eq!(parse_command("resume", &serde_json::json!({})).unwrap(), Command::Resume);
        assert_eq!(parse_command("skip_next", &serde_json::json!({})).unwrap(), Command::SkipNext);
        assert_eq!(parse_command("skip_prev", &serde_json::json!({})).unwrap(), Command::SkipPrev);
    }

    #[test]
    fn parses_seek() {
        let command = parse_command("seek_to", &serde_json::json!({"position": 42_000})).unwrap();
        assert_eq!(command, Command::Seek { position_ms: 42_000 });
    }

    #[test]
    fn parses_bool_toggles() {
        let on = serde_json::json!({"value": true});
        assert_eq!(parse_command("set_shuffling_context", &on).unwrap(), Command::Shuffle { value: true });
        assert_eq!(
            parse_command("set_repeating_context", &on).unwrap(),
            Command::RepeatContext { value: true }
        );
        assert_eq!(
            parse_command("set_repeating_track", &on).unwrap(),
            Command::RepeatTrack { value: true }
        );
    }

    #[test]
    fn parses_queue_commands() {
        let set_queue = serde_json::json!({"next_tracks": [{"uri": "spotify:track:a"}, {"uri": "spotify:track:b"}]});
        assert_eq!(
            parse_command("set_queue", &set_queue).unwrap(),
            Command::SetQueue {
                next_tracks: vec![
                    QueuedTrack { uri: "spotify:track:a".to_string() },
                    QueuedTrack { uri: "spotify:track:b".to_string() },
                ]
            }
        );

        let add = serde_json::json!({"track_uri": "spotify:track:c"});
        assert_eq!(
            parse_command("add_to_queue", &add).unwrap(),
            Command::AddToQueue { track_uri: "spotify:track:c".to_string() }
        );
    }

    #[test]
    fn parses_transfer_decoding_base64() {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"proto-bytes");
        let payload = serde_json::json!({"transfer_state": encoded});
        let command = parse_command("transfer", &payload).unwrap();
        assert_eq!(command, Command::Transfer { transfer_state: b"proto-bytes".to_vec() });
    }

    #[test]
    fn unknown_endpoint_is_unsupported() {
        let result = parse_command("something_new", &serde_json::json!({}));
        assert!(matches!(result, Err(CommandParseError::UnsupportedEndpoint(_))));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let result = parse_command("seek_to", &serde_json::json!({"position": "not-a-number"}));
        assert!(matches!(result, Err(CommandParseError::MalformedPayload { .. })));
    }
}
