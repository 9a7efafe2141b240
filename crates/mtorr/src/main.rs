use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use microtorr::{
    client::Client,
    config::Config,
    metainfo::MetaInfo,
    shutdown::Exit,
    utils::to_human_readable,
};
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

use args::{Args, Command};

mod args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Download { torrent, config } => download(torrent, config).await,
        Command::Create { file, tracker, piece_length, out } => {
            let _guard = init_logging(Level::INFO, None);
            create(file, tracker, piece_length, out).await
        }
        Command::Info { torrent } => {
            let _guard = init_logging(Level::INFO, None);
            print_info(torrent).await
        }
    }
}

/// Log to stdout, or to `log_file` through a non blocking writer. The guard
/// must live until the end of the program to flush the file.
fn init_logging(level: Level, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time();

    let (res, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_else(|| "mtorr.log".as_ref());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

            let subscriber = builder.with_writer(writer).with_ansi(false).finish();
            (tracing::subscriber::set_global_default(subscriber), Some(guard))
        }
        None => (tracing::subscriber::set_global_default(builder.finish()), None),
    };

    if let Err(e) = res {
        eprintln!("setting default subscriber failed: {e}");
    }
    guard
}

async fn download(torrent: PathBuf, cli_config: Config) -> ExitCode {
    let config = match Config::load(cli_config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_logging(config.max_level(), config.log_file.as_deref());

    let meta = match MetaInfo::load(&torrent).await {
        Ok(meta) => meta,
        Err(e) => {
            error!("could not load {torrent:?}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("swarm {} of {}", meta.swarm_id(), meta.info.name);

    match Client::new(meta, config).start().await {
        Ok(Exit::Completed) | Ok(Exit::Interrupted) => ExitCode::SUCCESS,
        // already logged by whoever failed
        Ok(Exit::Failed(_)) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn create(
    file: PathBuf,
    tracker: String,
    piece_length: u32,
    out: Option<PathBuf>,
) -> ExitCode {
    let meta = match MetaInfo::create(&file, tracker, piece_length).await {
        Ok(meta) => meta,
        Err(e) => {
            error!("could not create the descriptor of {file:?}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let out = out.unwrap_or_else(|| PathBuf::from(format!("{}.mtorrent", meta.info.name)));
    if let Err(e) = meta.save(&out).await {
        error!("could not write {out:?}: {e}");
        return ExitCode::FAILURE;
    }

    info!("wrote {out:?} for swarm {}", meta.swarm_id());
    ExitCode::SUCCESS
}

async fn print_info(torrent: PathBuf) -> ExitCode {
    let meta = match MetaInfo::load(&torrent).await {
        Ok(meta) => meta,
        Err(e) => {
            error!("could not load {torrent:?}: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("name:         {}", meta.info.name);
    println!("size:         {}", to_human_readable(meta.info.length as f64));
    println!("piece length: {}", meta.info.piece_length);
    println!("pieces:       {}", meta.pieces_count());
    println!("swarm id:     {}", meta.swarm_id());
    println!("tracker:      {}", meta.announce);
    ExitCode::SUCCESS
}
