use stomp_relay::{AckMode, Client, ClientEvent, ConnectOptions, Heartbeat, Publish, TcpConnector};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Expects a STOMP broker on localhost:61613 (e.g. RabbitMQ with the stomp plugin).
    // RUST_LOG=stomp_relay=debug shows the frames going by.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = ConnectOptions::default()
        .login("guest", "guest")
        .heartbeat(Heartbeat::new(10_000, 10_000))
        .reconnect(false);
    let (client, mut events) = Client::new(TcpConnector::new("127.0.0.1:61613"), options);
    client.activate().await;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ClientEvent::Connected(info))) => {
                println!("connected: STOMP {} ({:?})", info.version, info.server);
                break;
            }
            Ok(Some(other)) => println!("event: {:?}", other),
            Ok(None) | Err(_) => {
                println!("could not connect");
                return Ok(());
            }
        }
    }

    let sub = client
        .subscribe_with_ack("/queue/test", AckMode::Auto, |msg| {
            println!("received: {}", msg.body_text().unwrap_or("<binary>"));
        })
        .await?;

    let receipt = client
        .publish_with_receipt(
            Publish::new("/queue/test").text("hello from stomp-relay"),
            Duration::from_secs(5),
        )
        .await?;
    println!("broker confirmed: {}", receipt.get_header("receipt-id").unwrap_or("?"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    sub.unsubscribe(Vec::new()).await?;
    client.deactivate().await;
    Ok(())
}
