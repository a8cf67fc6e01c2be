//! Minimal companion used by the integration tests and for local debugging.
//!
//! Receives the bridge arguments `<shared> <mp_shared> <notebook> <windows>
//! <segment>` and serves dispatches from stdin. Each script is a list of
//! commands, one per line:
//!
//! ```text
//! echo <text>            print a plain line
//! log <level> <message>  print a {"type":"log"} message
//! sleep <ms>             pause
//! set <name> <json>      return a variable to the host
//! unset <name>           drop a variable (pushed or set)
//! fail <message>         stop the script with an error
//! exit <code>            exit the process immediately
//! ```
//!
//! Pushed variables are echoed back unless unset.

use std::process::ExitCode;
use std::time::Duration;

use bifrost::bridge::protocol::CompanionMessage;
use bifrost::{CompanionWriter, JsonFileSync, ScriptHandler, SerializerRegistry, Variable};

struct StubHandler {
    sync: JsonFileSync,
    registry: SerializerRegistry,
}

#[async_trait::async_trait]
impl ScriptHandler for StubHandler {
    async fn execute(&self, script: &str, output: &CompanionWriter) -> Result<(), String> {
        let mut variables = self.sync.read_inbound().await.map_err(|e| e.to_string())?;

        for line in script.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();

            match command {
                "echo" => output.line(rest).await.map_err(|e| e.to_string())?,
                "log" => {
                    let (level, message) = rest.split_once(' ').unwrap_or(("info", rest));
                    let msg = CompanionMessage::new("log")
                        .with_field("level", level)
                        .with_field("message", message);
                    output.message(&msg).await.map_err(|e| e.to_string())?;
                }
                "sleep" => {
                    let ms: u64 = rest
                        .parse()
                        .map_err(|_| format!("sleep expects milliseconds, got {rest:?}"))?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "set" => {
                    let (name, json) = rest
                        .split_once(' ')
                        .ok_or_else(|| format!("set expects <name> <json>, got {rest:?}"))?;
                    let value: serde_json::Value =
                        serde_json::from_str(json).map_err(|e| format!("{name}: {e}"))?;
                    let encoded = self.registry.encode(&Variable::new(value))?;
                    variables.insert(name.to_string(), encoded);
                }
                "unset" => {
                    variables.remove(rest);
                }
                "fail" => return Err(rest.to_string()),
                "exit" => {
                    let code: i32 = rest.parse().unwrap_or(0);
                    tracing::info!(code, "Exiting on request");
                    std::process::exit(code);
                }
                other => return Err(format!("unknown command {other:?}")),
            }
        }

        self.sync
            .write_outbound(&variables)
            .await
            .map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    bifrost::logging::init_tracing();

    // The segment name is always the last bridge argument.
    let Some(segment) = std::env::args().skip(1).last() else {
        eprintln!("Usage: stub_companion <shared> <mp_shared> <notebook> <windows> <segment>");
        return ExitCode::from(2);
    };

    let handler = StubHandler {
        sync: JsonFileSync::from_env(&segment),
        registry: SerializerRegistry::new(),
    };
    tracing::info!(%segment, dir = %handler.sync.dir().display(), "Stub companion ready");

    let output = CompanionWriter::stdout();
    match bifrost::serve(tokio::io::stdin(), &output, &handler).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Companion stopped");
            ExitCode::FAILURE
        }
    }
}
