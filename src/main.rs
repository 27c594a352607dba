//! CLI for cmdbus
//!
//! Subcommands:
//! - `server`: run the in-process broker and the WebSocket command gateway
//! - `echo`: connect to the UI endpoint and round-trip one echo request

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use cmdbus::broker::{InMemoryBroker, InMemoryConnectionFactory};
use cmdbus::codec::Codec;
use cmdbus::config::load_config;
use cmdbus::gateway::{Gateway, WsCommands, start_websocket_server};
use cmdbus::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cmdbus")]
enum Command {
    /// Start the WebSocket command gateway
    Server,
    /// Send one echo request to a running gateway and print the reply
    Echo {
        /// UI endpoint URL
        #[arg(long, default_value = "ws://127.0.0.1:8080/ui/ws")]
        url: String,
        /// Text to echo
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let result = match cmd {
        Command::Server => run_server(config).await,
        Command::Echo { url, message } => run_echo(&url, &message).await,
    };
    if let Err(e) = result {
        error!("cmdbus failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: cmdbus::config::Settings) -> Result<(), Box<dyn Error>> {
    let addr = config.server.address();
    let connection_factory = Arc::new(InMemoryConnectionFactory::new(InMemoryBroker::new()));
    let gateway = Arc::new(Gateway::new(
        connection_factory,
        Arc::new(Codec::default()),
        WsCommands::with_defaults(),
        &config.gateway,
        &config.bus,
    ));

    let result: Result<(), Box<dyn Error>> = tokio::select! {
        served = start_websocket_server(&addr, gateway.clone()) => served.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };
    gateway.shutdown();
    result
}

async fn run_echo(url: &str, message: &str) -> Result<(), Box<dyn Error>> {
    use cmdbus::message::{EchoRequest, EchoResponse, WelcomeResponse};
    use futures_util::SinkExt;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let codec = Codec::default();
    let (mut ws_stream, _response) = connect_async(url).await?;

    let welcome = next_text(&mut ws_stream).await?;
    let welcome: WelcomeResponse = codec.decode_typed(&welcome)?;
    info!(session = %welcome.session_id, "connected");

    let request = Codec::encode(&EchoRequest::new(message))?;
    ws_stream.send(WsMessage::Text(request.into())).await?;

    let reply = next_text(&mut ws_stream).await?;
    let reply: EchoResponse = codec.decode_typed(&reply)?;
    println!("{}", reply.reply);

    ws_stream.close(None).await?;
    Ok(())
}

async fn next_text<S>(stream: &mut S) -> Result<String, Box<dyn Error>>
where
    S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    use futures_util::StreamExt;

    while let Some(frame) = stream.next().await {
        match frame? {
            tungstenite::Message::Text(text) => return Ok(text.as_str().to_string()),
            tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }
    Err("connection closed before a reply arrived".into())
}
