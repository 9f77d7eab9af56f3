use anyhow::Result;
use clap::Parser;
use log::info;
use proctrace::programs::DEFAULT_STRLEN;
use proctrace::{CommandBuilder, EventSource, LineParser, SourceOptions, TraceEvent, TraceKind};

#[derive(Parser)]
#[command(name = "pst-trace")]
#[command(about = "Print the events of one pst tracer as JSON lines")]
#[command(version)]
struct Cli {
    /// Which tracer to run: exec, open or chdir
    kind: TraceKind,

    /// Value of BPFTRACE_STRLEN
    #[arg(long, default_value_t = DEFAULT_STRLEN)]
    strlen: usize,

    /// Print the bpftrace program instead of running it
    #[arg(long)]
    print_program: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("PST_LOG", "info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let kind = cli.kind;

    if cli.print_program {
        println!("{}", kind.program());
        return Ok(());
    }

    trace_kind(kind, cli.strlen).await
}

async fn trace_kind(kind: TraceKind, strlen: usize) -> Result<()> {
    let mut command = CommandBuilder::new("bpftrace");
    command
        .args(["-e", kind.program()])
        .env("BPFTRACE_STRLEN", strlen.to_string());

    let parser: LineParser<TraceEvent> = Box::new(move |line: &str| {
        TraceEvent::parse(kind, line, strlen)
            .map(|event| (event.pid(), event))
            .ok_or_else(|| proctrace::TraceError::Parse {
                line: line.to_owned(),
                reason: "no event",
            })
    });
    let (source, mut events) =
        EventSource::spawn(kind.name(), &command, parser, None, &SourceOptions::default())?;
    info!("Tracing {} events, press Ctrl-C to stop", kind.name());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event.value)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    source.shutdown();
    source.exited().await;
    info!("Saw {} distinct pids", source.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_parsed_by_name() {
        let cli = Cli::try_parse_from(["pst-trace", "open", "--strlen", "64"]).unwrap();
        assert_eq!(cli.kind, TraceKind::Open);
        assert_eq!(cli.strlen, 64);

        let err = Cli::try_parse_from(["pst-trace", "fork"]).err().unwrap();
        assert!(err.to_string().contains("unknown trace kind `fork`"), "{err}");
    }
}
