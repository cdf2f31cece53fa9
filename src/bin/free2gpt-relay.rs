use free2gpt_relay::{RelayConfig, RelayState, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config: Option<RelayConfig> = None;
    let mut listen_override: Option<String> = None;
    let mut api_key_override: Option<String> = None;
    let mut json_logs = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--api-key" => {
                api_key_override = Some(args.next().ok_or("missing value for --api-key")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--help" | "-h" => {
                eprintln!(
                    "usage: free2gpt-relay [config.json] [--listen HOST:PORT] [--api-key KEY] [--json-logs]"
                );
                return Ok(());
            }
            path if !path.starts_with('-') => {
                config = Some(RelayConfig::load(path)?);
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let mut config = config.unwrap_or_default().apply_env();
    if let Some(listen) = listen_override {
        config.listen = listen;
    }
    if let Some(api_key) = api_key_override {
        config.api_key = api_key;
    }

    let listen = config.listen.clone();
    let mut state = RelayState::new(config);
    if json_logs {
        state = state.with_json_logs();
    }

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    eprintln!("free2gpt-relay listening on {listen}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
