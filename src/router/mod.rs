use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::RouterConfig;
use crate::server::canonical_url;

pub const PUSH_ENDPOINT_ARG: &str = "push.endpoint";

pub type CommandArgs = BTreeMap<String, Value>;

// Commands relayed to the routing layer. Hello announces a freshly bound
// device; Register asks for the push URL of a new channel.
#[derive(Clone, Debug, PartialEq)]
pub enum PushCommand {
    Hello {
        device_id: String,
        channel_ids: Vec<Value>,
        connect: Option<Value>,
    },
    Register {
        channel_id: String,
    },
}

// Called synchronously from the worker; the router performs no socket I/O of
// its own and may return without side effects.
pub trait Router: Send + Sync {
    fn handle_command(&self, command: PushCommand) -> (u16, CommandArgs);
}

// Default router for single-node deployments: push endpoints are minted
// under this node's own canonical base URL.
pub struct LocalRouter {
    endpoint_base: String,
}

impl LocalRouter {
    pub fn new(config: &RouterConfig) -> Self {
        let port = if config.port == 0 {
            String::new()
        } else {
            config.port.to_string()
        };
        Self {
            endpoint_base: canonical_url(&config.scheme, &config.host, &port),
        }
    }

    pub fn endpoint_base(&self) -> &str {
        &self.endpoint_base
    }
}

impl Router for LocalRouter {
    fn handle_command(&self, command: PushCommand) -> (u16, CommandArgs) {
        match command {
            PushCommand::Hello { .. } => (200, CommandArgs::new()),
            PushCommand::Register { channel_id } => {
                let mut args = CommandArgs::new();
                args.insert(
                    PUSH_ENDPOINT_ARG.to_owned(),
                    Value::String(format!("{}/update/{channel_id}", self.endpoint_base)),
                );
                (200, args)
            }
        }
    }
}
