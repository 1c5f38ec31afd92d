use relaygate_services::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaygate_observability::init();
    relaygate_services::serve(Service::Presence).await
}
