pub mod server;

use crate::api::ServerConfig;

pub enum Action {
    Server(Box<ServerConfig>),
}
