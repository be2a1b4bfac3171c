use shelly_gateway::{
    command_channel, load_worker_config, FileConfigStore, GatewayServer, LoggingBus,
    StatusRegistry, GATEWAY_ENDPOINT,
};

#[ntex::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let store = FileConfigStore::new(path);

    let registry = StatusRegistry::new(LoggingBus);
    let reporter = registry.get_or_create(GATEWAY_ENDPOINT);
    reporter.start("worker");

    let config = load_worker_config(&store, GATEWAY_ENDPOINT, &reporter).await;

    match config.mqtt {
        Some(mqtt) => {
            // the backend integration pushes SetSwitch/SetLight commands
            // into this channel; without one it stays idle
            let (_commands, receiver) = command_channel();
            GatewayServer::bind(mqtt, receiver, LoggingBus)?.run().await
        }
        None => {
            log::warn!("No mqtt configuration found, gateway will not listen");
            reporter.set_health(shelly_gateway::Health::Running);
            registry.spawn_reporting();
            std::future::pending::<()>().await;
            Ok(())
        }
    }
}
