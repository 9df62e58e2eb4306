use std::process;

use topicbus::BusConfig;
use topicbus_tap::{Command, USAGE, parse_args, run_listen, run_send};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// RUST_LOG wins; otherwise TOPICBUS_LOG picks the level. LOG_FORMAT=json for structured output.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("TOPICBUS_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!(
            "topicbus={level},topicbus_tap={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if msg.is_empty() {
                println!("{USAGE}");
                process::exit(0);
            }
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();
    let config = BusConfig::from_env();

    let result = match command {
        Command::Listen { channel, options } => {
            let stdout = std::io::stdout();
            run_listen(&channel, &options, config, &mut stdout.lock()).map(|_| ())
        }
        Command::Send {
            channel,
            topic,
            payload,
            options,
        } => run_send(&channel, &topic, payload.as_bytes(), &options, config).map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
