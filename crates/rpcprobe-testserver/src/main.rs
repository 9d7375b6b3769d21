use clap::Parser;
use core::net::SocketAddr;
use rpcprobe_testserver::TestServer;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(version, about = "Greeter test server for rpcprobe")]
struct CliArgs {
    /// Address to listen on
    #[arg(long, env = "TESTSERVER_ADDR", default_value = "127.0.0.1:50051")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let server = TestServer::bind(args.addr).await?;
    println!("Greeter listening on {}", server.addr());

    signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
