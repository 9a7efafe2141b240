use std::{net::SocketAddr, path::PathBuf, time::Duration};

use futures::{SinkExt, StreamExt};
use microtorr::{
    bitfield::{Bitfield, BitfieldExt},
    client::Client,
    config::ResolvedConfig,
    error::Error,
    handshake_peer,
    metainfo::{MetaInfo, DEFAULT_TRACKER},
    peer::PeerId,
    shutdown::Exit,
    tcp_wire::{Handshake, Message},
};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{net::TcpListener, time::timeout};

const PIECE_LENGTH: u32 = 16_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .compact()
        .without_time()
        .try_init();
}

fn temp_path(prefix: &str) -> PathBuf {
    let name: String =
        rand::thread_rng().sample_iter(Alphanumeric).take(16).map(char::from).collect();
    std::env::temp_dir().join(format!("{prefix}-{name}"))
}

/// A file of 3 full pieces and a short last one.
fn random_file() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..PIECE_LENGTH as usize * 3 + 1234).map(|_| rng.gen()).collect()
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn leecher_config(output: PathBuf, min_seeders: usize) -> ResolvedConfig {
    ResolvedConfig {
        min_seeders,
        output: Some(output),
        poll_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

struct Seeder {
    id: PeerId,
    addr: SocketAddr,
    shutdown: std::sync::Arc<microtorr::shutdown::Shutdown>,
    handle: tokio::task::JoinHandle<Result<Exit, Error>>,
}

async fn spawn_seeder(meta: MetaInfo, source: PathBuf) -> Seeder {
    let client = Client::new(meta, ResolvedConfig { seed: Some(source), ..Default::default() });
    let (listener, addr) = bind().await;
    let id = client.local_id();
    let shutdown = client.shutdown();
    let handle = tokio::spawn(client.run(listener, Vec::new(), None));
    Seeder { id, addr, shutdown, handle }
}

// A seeder and a leecher over loopback, without a tracker. The leecher
// must end with a file identical to the seeder's.
#[tokio::test]
async fn leecher_downloads_from_seeder() {
    init_tracing();

    let data = random_file();
    let source = temp_path("microtorr-seed");
    let output = temp_path("microtorr-out");
    tokio::fs::write(&source, &data).await.unwrap();

    let meta = MetaInfo::from_bytes("file.bin", &data, DEFAULT_TRACKER, PIECE_LENGTH).unwrap();
    assert_eq!(meta.pieces_count(), 4);

    let seeder = spawn_seeder(meta.clone(), source.clone()).await;

    let leecher = Client::new(meta, leecher_config(output.clone(), 1));
    let (listener, _) = bind().await;
    let exit = timeout(
        Duration::from_secs(30),
        leecher.run(listener, vec![(seeder.id, seeder.addr)], None),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(exit, Exit::Completed));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), data);

    // the seeder keeps running until told otherwise
    assert!(!seeder.handle.is_finished());
    seeder.shutdown.release(Exit::Interrupted).await;
    assert!(matches!(seeder.handle.await.unwrap().unwrap(), Exit::Interrupted));

    let _ = tokio::fs::remove_file(&source).await;
    let _ = tokio::fs::remove_file(&output).await;
}

// A peer that claims every piece but hangs up as soon as it is asked for
// one. The leecher must move on to the real seeder.
#[tokio::test]
async fn leecher_survives_a_peer_leaving() {
    init_tracing();

    let data = random_file();
    let source = temp_path("microtorr-seed");
    let output = temp_path("microtorr-out");
    tokio::fs::write(&source, &data).await.unwrap();

    let meta = MetaInfo::from_bytes("file.bin", &data, DEFAULT_TRACKER, PIECE_LENGTH).unwrap();
    let seeder = spawn_seeder(meta.clone(), source.clone()).await;

    let (flaky_listener, flaky_addr) = bind().await;
    let flaky_id = PeerId::generate();
    let swarm_id = meta.swarm_id();
    let pieces = meta.pieces_count();

    let flaky = tokio::spawn(async move {
        let (socket, _) = flaky_listener.accept().await.unwrap();
        let (_, mut socket) =
            handshake_peer::inbound(socket, Handshake::new(swarm_id, flaky_id)).await.unwrap();

        let mut bitfield = Bitfield::from_piece(pieces);
        bitfield.fill(true);
        socket.send(Message::Bitfield(bitfield)).await.unwrap();

        while let Some(Ok(msg)) = socket.next().await {
            if let Message::Request(_) = msg {
                // drop the connection without answering
                return;
            }
        }
    });

    let leecher = Client::new(meta, leecher_config(output.clone(), 2));
    let (listener, _) = bind().await;
    let peers = vec![(seeder.id, seeder.addr), (flaky_id, flaky_addr)];

    let exit = timeout(Duration::from_secs(30), leecher.run(listener, peers, None))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(exit, Exit::Completed));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), data);

    seeder.shutdown.release(Exit::Interrupted).await;
    let _ = seeder.handle.await;
    flaky.abort();

    let _ = tokio::fs::remove_file(&source).await;
    let _ = tokio::fs::remove_file(&output).await;
}

#[tokio::test]
async fn corrupt_seed_file_is_fatal() {
    init_tracing();

    let data = random_file();
    let meta = MetaInfo::from_bytes("file.bin", &data, DEFAULT_TRACKER, PIECE_LENGTH).unwrap();

    let mut corrupt = data.clone();
    corrupt[PIECE_LENGTH as usize + 7] ^= 0xff;
    let source = temp_path("microtorr-corrupt");
    tokio::fs::write(&source, &corrupt).await.unwrap();

    let client = Client::new(meta, ResolvedConfig { seed: Some(source.clone()), ..Default::default() });
    let (listener, _) = bind().await;
    let exit = client.run(listener, Vec::new(), None).await.unwrap();

    assert!(matches!(exit, Exit::Failed(Error::SeedFileInvalid)));
    let _ = tokio::fs::remove_file(&source).await;
}
