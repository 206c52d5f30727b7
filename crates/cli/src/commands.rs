//! Subcommands.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args as ClapArgs, Subcommand};
use corelib::{CodecType, Options};
use rpc_client::{xdial, CancellationToken, Client, CompletionQueue};
use rpc_server::Server;
use tokio::net::TcpListener;

use crate::arith::{Arith, Args};

/// Where and how to connect.
#[derive(Debug, Clone, ClapArgs)]
pub struct ConnectArgs {
    /// Server address as protocol@addr (tcp, http or unix)
    #[arg(long, default_value = "tcp@127.0.0.1:9999")]
    pub addr: String,

    /// Body codec: json, binary or a full codec identifier
    #[arg(long, default_value = "json", value_parser = parse_codec)]
    pub codec: CodecType,

    /// Bound on connecting plus negotiating; 0 waits forever
    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Server-side bound on each handler; 0 means none
    #[arg(long, default_value_t = 0)]
    pub handle_timeout_ms: u64,
}

impl ConnectArgs {
    pub fn options(&self) -> Options {
        Options::default()
            .with_codec(self.codec)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_handle_timeout(Duration::from_millis(self.handle_timeout_ms))
    }

    async fn dial(&self) -> anyhow::Result<Client> {
        xdial(&self.addr, Some(self.options()))
            .await
            .with_context(|| format!("dial {}", self.addr))
    }
}

fn parse_codec(s: &str) -> Result<CodecType, String> {
    match s {
        "json" => Ok(CodecType::Json),
        "binary" | "bincode" => Ok(CodecType::Binary),
        other => other.parse().map_err(|e: corelib::Error| e.to_string()),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Host the Arith service
    Serve {
        #[arg(long, default_value = "127.0.0.1:9999")]
        addr: String,

        /// Accept HTTP CONNECT instead of raw RPC connections
        #[arg(long)]
        http: bool,
    },

    /// Make one call and print the reply
    Call {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Target as Service.Method
        service_method: String,

        a: i64,
        b: i64,

        /// Give up waiting after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Issue many concurrent Arith.Multiply calls on one connection
    Bench {
        #[command(flatten)]
        connect: ConnectArgs,

        #[arg(short = 'n', long, default_value_t = 100)]
        calls: u64,
    },
}

/// What a command produced.
#[derive(Debug)]
pub enum CommandResult {
    Stopped,
    Reply {
        service_method: String,
        reply: i64,
    },
    Bench {
        calls: u64,
        failures: u64,
        elapsed: Duration,
    },
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Stopped => write!(f, "server stopped"),
            CommandResult::Reply {
                service_method,
                reply,
            } => write!(f, "{service_method} = {reply}"),
            CommandResult::Bench { calls, failures, elapsed } => {
                let per_sec = *calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
                write!(f, "{calls} calls, {failures} failed, {elapsed:?} ({per_sec:.0} calls/s)")
            }
        }
    }
}

impl Command {
    pub async fn execute(self) -> anyhow::Result<CommandResult> {
        match self {
            Command::Serve { addr, http } => serve(&addr, http).await,
            Command::Call {
                connect,
                service_method,
                a,
                b,
                timeout_ms,
            } => call(&connect, &service_method, Args { a, b }, timeout_ms).await,
            Command::Bench { connect, calls } => bench(&connect, calls).await,
        }
    }
}

async fn serve(addr: &str, http: bool) -> anyhow::Result<CommandResult> {
    let server = Arc::new(Server::new());
    server.register_receiver(Arith)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, http, "serving");

    let accepting = async {
        if http {
            server.accept_http(listener).await
        } else {
            server.accept(listener).await
        }
    };
    tokio::select! {
        result = accepting => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    Ok(CommandResult::Stopped)
}

async fn call(
    connect: &ConnectArgs,
    service_method: &str,
    args: Args,
    timeout_ms: Option<u64>,
) -> anyhow::Result<CommandResult> {
    let client = connect.dial().await?;
    let reply = match timeout_ms {
        Some(ms) => {
            client
                .call_timeout(Duration::from_millis(ms), service_method, &args)
                .await?
        }
        None => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            client.call(&cancel, service_method, &args).await?
        }
    };
    client.close()?;
    Ok(CommandResult::Reply {
        service_method: service_method.to_string(),
        reply,
    })
}

async fn bench(connect: &ConnectArgs, calls: u64) -> anyhow::Result<CommandResult> {
    let client = connect.dial().await?;
    let (done, mut completions) = CompletionQueue::unbounded();
    let mut expected = std::collections::HashMap::new();

    let started = Instant::now();
    for i in 0..calls {
        let args = Args { a: i as i64, b: i as i64 };
        let seq = client.go("Arith.Multiply", &args, done.clone()).await?;
        // Seq 0 means the call never registered; its completion carries the error.
        if seq != 0 {
            expected.insert(seq, args.a * args.b);
        }
    }
    drop(done);

    let mut failures = 0;
    let mut received = 0;
    while received < calls {
        let Some(call) = completions.recv().await else {
            break;
        };
        received += 1;
        let seq = call.seq;
        match call.into_reply::<i64>() {
            Ok(got) if expected.get(&seq) == Some(&got) => {}
            Ok(got) => {
                tracing::warn!(seq, got, want = ?expected.get(&seq), "wrong reply");
                failures += 1;
            }
            Err(err) => {
                tracing::warn!(seq, error = %err, "call failed");
                failures += 1;
            }
        }
    }
    failures += calls - received;
    let elapsed = started.elapsed();
    client.close()?;

    Ok(CommandResult::Bench {
        calls,
        failures,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;
    use clap::Parser;

    #[test]
    fn test_parse_codec() {
        assert_eq!(parse_codec("json"), Ok(CodecType::Json));
        assert_eq!(parse_codec("binary"), Ok(CodecType::Binary));
        assert_eq!(parse_codec("application/bincode"), Ok(CodecType::Binary));
        assert!(parse_codec("application/xml").is_err());
    }

    #[test]
    fn test_call_options() {
        let config = CliConfig::try_parse_from([
            "muxrpc",
            "call",
            "--codec",
            "binary",
            "--handle-timeout-ms",
            "250",
            "Arith.Sum",
            "1",
            "2",
        ])
        .unwrap();
        let Command::Call { connect, service_method, a, b, .. } = config.command else {
            panic!("expected call");
        };
        assert_eq!(service_method, "Arith.Sum");
        assert_eq!((a, b), (1, 2));
        let opt = connect.options();
        assert_eq!(opt.codec_type, CodecType::Binary);
        assert_eq!(opt.handle_timeout, Duration::from_millis(250));
        assert_eq!(opt.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_bench_against_local_server() {
        let server = Arc::new(Server::new());
        server.register_receiver(Arith).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.accept(listener).await }
        });

        let connect = ConnectArgs {
            addr: format!("tcp@{addr}"),
            codec: CodecType::Binary,
            connect_timeout_ms: 1_000,
            handle_timeout_ms: 0,
        };
        let result = bench(&connect, 50).await.unwrap();
        let CommandResult::Bench { calls, failures, .. } = result else {
            panic!("expected bench result");
        };
        assert_eq!((calls, failures), (50, 0));
    }

    #[tokio::test]
    async fn test_bench_counts_remote_errors() {
        // Nothing registered: every call comes back with an error header.
        let server = Arc::new(Server::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.accept(listener).await });

        let connect = ConnectArgs {
            addr: format!("tcp@{addr}"),
            codec: CodecType::Json,
            connect_timeout_ms: 1_000,
            handle_timeout_ms: 0,
        };
        let result = bench(&connect, 20).await.unwrap();
        let CommandResult::Bench { calls, failures, .. } = result else {
            panic!("expected bench result");
        };
        assert_eq!((calls, failures), (20, 20));
    }
}
