// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use stonenet::{
    check_operation, setup_tracing, AppResult, ClientId, Connection, ControlOutcome,
    EventHandler, LineProtocol, Operation, PidFile, Request, Server, ServerConfig,
};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    #[arg(value_enum)]
    pub operation: Operation,
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Line based echo, `quit` says goodbye and closes the connection.
struct Echo;

impl EventHandler for Echo {
    fn on_message<'a>(&'a self, request: &'a Request) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let result = if request.data().trim_ascii() == b"quit" {
                request
                    .server()
                    .close_client(request.client_id(), "bye")
                    .await
            } else {
                request.reply(request.data().clone()).await
            };
            if let Err(e) = result {
                error!("reply to {} err: {}", request.client_id(), e);
            }
        })
    }

    fn on_connect<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        client_id: &'a ClientId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!("client {} connected from {}", client_id, connection.remote_addr());
        })
    }

    fn on_close<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        client_id: &'a ClientId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!("client {} from {} left", client_id, connection.remote_addr());
        })
    }
}

fn load_config(conf: Option<&str>) -> AppResult<ServerConfig> {
    match conf {
        Some(path) => ServerConfig::set_up_config(PathBuf::from(path)),
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                ServerConfig::set_up_config(default_path)
            } else {
                Ok(ServerConfig::default())
            }
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let server_config = load_config(commandline.conf.as_deref())?;
    let pid_file = PidFile::new(&server_config.general.pid_file);
    if let ControlOutcome::Signalled(pid) = check_operation(commandline.operation, &pid_file)? {
        println!("{:?} sent to stonenet pid {}", commandline.operation, pid);
        return Ok(());
    }

    let _log_guard = setup_tracing(&server_config.log, server_config.general.model)?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let server = Server::new(server_config)
        .set_protocol(LineProtocol::default())
        .set_event_handler(Echo);
    rt.block_on(server.run())?;

    info!("stonenet exit");
    Ok(())
}
