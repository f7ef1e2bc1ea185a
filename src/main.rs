use clap::{crate_version, App, Arg};
use grpc2::{BadStatus, Server, Service, StatusCode};

/// Echoes every request message back to the caller.
struct Echo;

impl Service for Echo {
    fn name(&self) -> &str {
        "example.Echo"
    }

    fn handle(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, BadStatus> {
        match method {
            "Echo" => Ok(request.to_vec()),
            other => Err(BadStatus::new(StatusCode::Unimplemented, other)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("grpc2")
        .version(crate_version!())
        .arg(
            Arg::with_name("addr")
                .help("listen address")
                .default_value("127.0.0.1:50051")
                .index(1),
        )
        .get_matches();
    let addr = matches.value_of("addr").expect("addr has a default");

    let mut server = Server::new();
    server.register(Echo);
    server.serve(addr).await?;
    Ok(())
}
