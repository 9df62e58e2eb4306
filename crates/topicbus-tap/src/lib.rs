//! Command-line tap for topicbus channels.
//!
//! `listen` subscribes to a channel and prints every matching message;
//! `send` publishes a single message.

pub mod error;

use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use topicbus::{BusConfig, Message, Publisher, Subscriber, TransportKind};

use crate::error::{Result, TapError};

/// Time given to queued frames to reach subscribers before `send` closes.
const SEND_LINGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub transport: TransportKind,
    /// Topic filters for `listen`. Empty means everything.
    pub topics: Vec<String>,
    /// Stop `listen` after this many messages.
    pub count: Option<u64>,
    /// How long `send` waits for a subscriber before publishing anyway.
    pub wait: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            transport: TransportKind::Ipc,
            topics: Vec::new(),
            count: None,
            wait: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Listen {
        channel: String,
        options: Options,
    },
    Send {
        channel: String,
        topic: String,
        payload: String,
        options: Options,
    },
}

pub const USAGE: &str = "\
Usage: topicbus-tap listen <channel> [--topic <filter>]... [--count <n>] [--transport <kind>]
       topicbus-tap send <channel> <topic> <payload> [--wait-ms <ms>] [--transport <kind>]

Options:
  --transport <kind>  ipc, network or inproc [default: ipc]
  --topic <filter>    Topic prefix to listen for; repeatable [default: all topics]
  --count <n>         Exit after receiving n messages
  --wait-ms <ms>      Wait this long for a subscriber before sending [default: 1000]";

/// Parse `argv`. An empty error message means help was requested.
pub fn parse_args(args: &[String]) -> std::result::Result<Command, String> {
    let mut options = Options::default();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--transport" => {
                i += 1;
                let value = args.get(i).ok_or("--transport requires a value")?;
                options.transport = value.parse()?;
            }
            "--topic" => {
                i += 1;
                options
                    .topics
                    .push(args.get(i).ok_or("--topic requires a value")?.clone());
            }
            "--count" => {
                i += 1;
                let value = args.get(i).ok_or("--count requires a value")?;
                let count = value
                    .parse()
                    .map_err(|_| format!("invalid --count '{value}'"))?;
                options.count = Some(count);
            }
            "--wait-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--wait-ms requires a value")?;
                let ms = value
                    .parse()
                    .map_err(|_| format!("invalid --wait-ms '{value}'"))?;
                options.wait = Duration::from_millis(ms);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = positional.next().ok_or("missing command: listen or send")?;
    let channel = positional.next().ok_or("missing required argument: <channel>")?;

    let parsed = match command.as_str() {
        "listen" => Command::Listen { channel, options },
        "send" => {
            let topic = positional.next().ok_or("missing required argument: <topic>")?;
            let payload = positional
                .next()
                .ok_or("missing required argument: <payload>")?;
            Command::Send {
                channel,
                topic,
                payload,
                options,
            }
        }
        other => return Err(format!("unknown command '{other}', expected listen or send")),
    };

    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(parsed)
}

/// One output line per message: topic, a tab, then the payload.
pub fn format_message(message: &Message) -> String {
    format!(
        "{}\t{}",
        message.topic(),
        String::from_utf8_lossy(message.payload())
    )
}

/// Print messages until Ctrl-C or `options.count` is reached. Returns the number printed.
pub fn run_listen(
    channel: &str,
    options: &Options,
    config: BusConfig,
    out: &mut impl Write,
) -> Result<u64> {
    let mut subscriber = Subscriber::with_config(channel, options.transport, config)?;
    if options.topics.is_empty() {
        subscriber.subscribe("");
    }
    for topic in &options.topics {
        subscriber.subscribe(topic);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber.start_loop(move |message| {
        // The receiver is gone once listening ends; nothing left to print to.
        let _ = tx.send(format_message(&message));
        Ok(())
    })?;

    tracing::info!(channel, transport = %options.transport, filters = ?subscriber.filters(), "Listening");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(TapError::Runtime)?;

    let printed = runtime.block_on(async {
        let mut printed = 0u64;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            if options.count.is_some_and(|n| printed >= n) {
                break;
            }
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Interrupted");
                    break;
                }
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    writeln!(out, "{line}").map_err(TapError::Output)?;
                    out.flush().map_err(TapError::Output)?;
                    printed += 1;
                }
            }
        }
        Ok::<_, TapError>(printed)
    })?;

    drop(runtime);
    subscriber.close();
    tracing::info!(channel, printed, "Stopped listening");
    Ok(printed)
}

/// Publish one message. Returns the number of subscribers it was queued for.
pub fn run_send(
    channel: &str,
    topic: &str,
    payload: &[u8],
    options: &Options,
    config: BusConfig,
) -> Result<usize> {
    let mut publisher = Publisher::with_config(channel, options.transport, config)?;

    if !publisher.wait_for_subscribers(1, options.wait) {
        tracing::warn!(channel, wait = ?options.wait, "No subscriber connected, message will not be delivered");
    }
    let peers = publisher.peer_count();
    publisher.publish(topic, payload)?;

    if peers > 0 {
        std::thread::sleep(SEND_LINGER);
    }
    publisher.close();

    tracing::info!(channel, topic, peers, "Sent");
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("topicbus-tap")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    fn inproc_channel(prefix: &str) -> String {
        format!("{prefix}-{}", std::process::id())
    }

    #[test]
    fn parses_listen_with_options() {
        let cmd = parse_args(&argv(&[
            "listen", "metrics", "--topic", "cpu", "--topic", "mem", "--count", "3",
            "--transport", "tcp",
        ]))
        .unwrap();
        insta::assert_debug_snapshot!(cmd, @r#"
        Listen {
            channel: "metrics",
            options: Options {
                transport: Network,
                topics: [
                    "cpu",
                    "mem",
                ],
                count: Some(
                    3,
                ),
                wait: 1s,
            },
        }
        "#);
    }

    #[test]
    fn parses_send() {
        let cmd = parse_args(&argv(&["send", "X", "greet", "hi", "--wait-ms", "50"])).unwrap();
        assert_eq!(
            cmd,
            Command::Send {
                channel: "X".into(),
                topic: "greet".into(),
                payload: "hi".into(),
                options: Options {
                    wait: Duration::from_millis(50),
                    ..Options::default()
                },
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        let cases: [(&[&str], &str); 6] = [
            (&[], "missing command: listen or send"),
            (&["listen"], "missing required argument: <channel>"),
            (&["send", "c", "t"], "missing required argument: <payload>"),
            (&["listen", "c", "extra"], "unexpected argument: extra"),
            (&["listen", "c", "--count", "many"], "invalid --count 'many'"),
            (&["watch", "c"], "unknown command 'watch', expected listen or send"),
        ];
        for (args, expected) in cases {
            assert_eq!(parse_args(&argv(args)).unwrap_err(), expected, "{args:?}");
        }
        assert_eq!(parse_args(&argv(&["--help"])).unwrap_err(), "");
        assert!(
            parse_args(&argv(&["listen", "c", "--transport", "carrier-pigeon"]))
                .unwrap_err()
                .contains("carrier-pigeon")
        );
    }

    #[test]
    fn formats_binary_payloads_lossily() {
        let line = format_message(&Message::new("raw", vec![b'o', b'k', 0xff]));
        assert_eq!(line, "raw\tok\u{fffd}");
    }

    #[test]
    fn send_reaches_waiting_subscriber() {
        let channel = inproc_channel("tap-send");
        let options = Options {
            transport: TransportKind::Inproc,
            wait: Duration::from_secs(2),
            ..Options::default()
        };

        let mut subscriber =
            Subscriber::with_config(&channel, TransportKind::Inproc, BusConfig::default()).unwrap();
        subscriber.subscribe("greet");

        let peers = run_send(&channel, "greet", b"hi", &options, BusConfig::default()).unwrap();
        assert_eq!(peers, 1);

        let message = subscriber.receive_ms(1000).unwrap().unwrap();
        assert_eq!(format_message(&message), "greet\thi");
    }

    #[test]
    fn listen_stops_after_count() {
        let channel = inproc_channel("tap-listen");
        let options = Options {
            transport: TransportKind::Inproc,
            topics: vec!["keep".into()],
            count: Some(2),
            ..Options::default()
        };

        let publisher =
            Publisher::with_config(&channel, TransportKind::Inproc, BusConfig::default()).unwrap();
        let listener = std::thread::spawn(move || {
            let mut out = Vec::new();
            let printed = run_listen(&channel, &options, BusConfig::default(), &mut out).unwrap();
            (printed, String::from_utf8(out).unwrap())
        });

        assert!(publisher.wait_for_subscribers(1, Duration::from_secs(2)));
        for (topic, payload) in [("keep/1", "a"), ("skip", "b"), ("keep/2", "c"), ("keep/3", "d")] {
            publisher.publish(topic, payload.as_bytes()).unwrap();
        }

        let (printed, output) = listener.join().unwrap();
        assert_eq!(printed, 2);
        assert_eq!(output, "keep/1\ta\nkeep/2\tc\n");
    }
}
