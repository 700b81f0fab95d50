use coedit::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    let server = CollabServer::new(config);

    // Seed one room so clients have somewhere to connect out of the box;
    // further rooms come from the room-management layer.
    let room_id = server.registry().write().await.create_room("plaintext");
    log::info!("seed room available at /ws/{room_id}");

    if let Err(e) = server.run().await {
        log::error!("server exited: {e}");
        std::process::exit(1);
    }
}
