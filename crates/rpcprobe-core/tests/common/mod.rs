#![allow(dead_code)]

use rpcprobe_core::{DynamicMessage, RunConfig, SchemaSource, Session, StreamOptions};
use rpcprobe_testserver::{PROTO_FILE, TestServer};

pub const UNARY: &str = "helloworld.Greeter/SayHello";
pub const SERVER_STREAM: &str = "helloworld.Greeter/SayHellos";
pub const CLIENT_STREAM: &str = "helloworld.Greeter/SayHelloCS";
pub const BIDI: &str = "helloworld.Greeter.SayHelloBidi";

pub async fn start() -> TestServer {
    TestServer::start().await.unwrap()
}

pub fn config(server: &TestServer, target: &str) -> RunConfig {
    RunConfig::new(server.target(), target, SchemaSource::proto(PROTO_FILE))
}

pub async fn session(server: &TestServer, target: &str, stream: StreamOptions) -> Session {
    Session::connect(config(server, target).with_stream(stream))
        .await
        .unwrap()
}

pub fn hello(session: &Session, name: &str, count: u32) -> DynamicMessage {
    session
        .message_from_json(&format!(r#"{{"name":"{name}","count":{count}}}"#))
        .unwrap()
}

pub fn text(message: &DynamicMessage, field: &str) -> String {
    message
        .get_field_by_name(field)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn count(message: &DynamicMessage) -> u32 {
    message
        .get_field_by_name("count")
        .and_then(|v| v.as_u32())
        .unwrap_or_default()
}
