//! Tether CLI - bootstrap target for spawned children and a small tool for
//! driving them.
//!
//! `first-stage` and `second-stage` are run by a parent during the bootstrap
//! handshake and are not meant to be typed by hand.

mod functions;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use tether_core::{
    forward_layer, ChildConfig, ChildSetup, ConnectOptions, Context, ExternalContext,
    InProcessConnector, Kwargs, LocalConnector, Router, RouterBuilder, Value,
};
use tracing::{debug, info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Message router and RPC runtime for process trees")]
struct Args {
    /// Enable debug logging, here and in children
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Call a function in a freshly started child and print the result
    Call {
        /// Function path, e.g. `example.add`
        function: String,

        /// Positional arguments; integers, floats and true/false are typed
        args: Vec<String>,

        /// Run the child on a thread of this process
        #[arg(long)]
        in_process: bool,

        /// Seconds to wait for the child to start
        #[arg(long, default_value = "30")]
        connect_timeout: f64,
    },

    /// Start a child and measure call round trips
    Ping {
        /// Number of round trips
        #[arg(short, long, default_value = "3")]
        count: u32,
    },

    #[command(hide = true, name = "first-stage")]
    FirstStage { preamble_len: usize },

    #[command(hide = true, name = "second-stage")]
    SecondStage,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::FirstStage { preamble_len } => {
            // Only returns when exec fails.
            let err = match tether_core::first_stage(preamble_len) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            bail!("first stage failed: {}", err);
        }
        Command::SecondStage => second_stage(),
        Command::Call {
            function,
            args: call_args,
            in_process,
            connect_timeout,
        } => {
            let router = start_master(args.debug)?;
            let options = ConnectOptions::default()
                .connect_timeout(Duration::from_secs_f64(connect_timeout.max(0.001)));
            let result = connect(&router, in_process, options).and_then(|child| {
                let values = call_args.iter().map(String::as_str).map(parse_arg).collect();
                child
                    .call(function.as_str(), values, Kwargs::new())
                    .with_context(|| format!("calling {}", function))
            });
            stop(&router)?;
            println!("{:?}", result?);
            Ok(())
        }
        Command::Ping { count } => {
            let router = start_master(args.debug)?;
            let result = ping(&router, count);
            stop(&router)?;
            result
        }
    }
}

fn start_master(debug: bool) -> Result<Router> {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let mut builder = RouterBuilder::new()
        .registry(functions::registry())
        .services(functions::services())
        .debug(debug);
    if debug {
        builder = builder.log_level("debug");
    }
    let router = builder.build()?;

    let on_signal = router.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, exiting");
        on_signal.shutdown();
    })
    .context("installing signal handler")?;
    Ok(router)
}

fn connect(router: &Router, in_process: bool, options: ConnectOptions) -> Result<Context> {
    let child = if in_process {
        router.connect(&InProcessConnector::for_router(router), options)?
    } else {
        router.connect(&LocalConnector::current_exe()?, options)?
    };
    debug!("connected to {:?}", child);
    Ok(child)
}

fn stop(router: &Router) -> Result<()> {
    router.shutdown();
    router.join()?;
    Ok(())
}

fn ping(router: &Router, count: u32) -> Result<()> {
    let child = connect(router, false, ConnectOptions::default())?;
    let pid = child.call("example.pid", Vec::new(), Kwargs::new())?;
    let name = child.name().unwrap_or_default();
    for seq in 0..count {
        let started = Instant::now();
        child.call("example.echo", vec![Value::from(seq)], Kwargs::new())?;
        println!(
            "{} (pid {:?}): seq={} time={:.3} ms",
            name,
            pid,
            seq,
            started.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

/// Runs after the first stage exec()s us with the parent socket on fd 100.
fn second_stage() -> Result<()> {
    let config = ChildConfig::read_inherited().context("reading second-stage config")?;

    // Stdout and stderr end up in the log stream, so records only travel
    // to the master.
    let level = config
        .log_level
        .clone()
        .unwrap_or_else(|| if config.debug { "debug" } else { "info" }.to_string());
    let (layer, forward) = forward_layer();
    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(layer)
        .init();

    let setup = ChildSetup {
        registry: functions::registry(),
        services: functions::services(),
        forward: Some(forward),
    };
    ExternalContext::main(config, setup)?;
    Ok(())
}

fn parse_arg(arg: &str) -> Value {
    if let Ok(i) = arg.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(x) = arg.parse::<f64>() {
        return Value::Float(x);
    }
    match arg {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(arg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_types() {
        assert_eq!(parse_arg("5"), Value::Int(5));
        assert_eq!(parse_arg("2.5"), Value::Float(2.5));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("five"), Value::from("five"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["tether", "call", "example.add", "2", "3"]).unwrap();
        match args.command {
            Command::Call { function, args, .. } => {
                assert_eq!(function, "example.add");
                assert_eq!(args, vec!["2", "3"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Args::try_parse_from(["tether", "first-stage", "12"]).is_ok());
    }
}
