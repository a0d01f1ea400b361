mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use lanshare_net::notify::Notification;
use lanshare_net::{
    BandwidthMode, Dialer, JobState, NetError, NodeOptions, ReceiveConfirmer, SecureTransport,
};
use lanshare_shared::crypto::{hash, hash_file};
use lanshare_shared::identity::Keystore;
use lanshare_shared::protocol::{FileHeader, FrameKind, Preamble, ACK_INTEGRITY, ACK_REJECTED};
use lanshare_shared::types::{Direction, NodeId};

use common::{
    eventually, part_files, payload, start_node, wait_for, FlakyDialer, ScriptedConfirmer,
};

#[tokio::test]
async fn test_loopback_transfer_preserves_content() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |_| {}).await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);
    let mut bob_events = bob.node.notifier.subscribe();

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("photo.raw");
    tokio::fs::write(&src, payload(300 * 1024)).await.unwrap();

    let report = alice
        .node
        .transfers
        .send_file(&peer, &src, "")
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.size, 300 * 1024);

    let received = bob.save_dir().join("photo.raw");
    assert_eq!(hash_file(&received).await.unwrap(), report.hash);
    assert_eq!(hash_file(&src).await.unwrap(), report.hash);
    assert!(part_files(&bob.save_dir()).is_empty());

    let n = wait_for(&mut bob_events, |n| {
        matches!(n, Notification::TransferReceived { .. })
    })
    .await;
    assert_eq!(
        n,
        Notification::TransferReceived {
            file: "photo.raw".into(),
            from: alice.id(),
        }
    );

    let downloads = bob.node.journal.with(|db| db.list_downloads()).unwrap();
    assert_eq!(downloads.len(), 1);
    assert!(downloads[0].path.ends_with("photo.raw"));
    assert!(alice.node.transfers.jobs().is_empty());
}

#[tokio::test]
async fn test_corrupted_payload_is_rejected_and_discarded() {
    let network = Keystore::generate();
    let bob = start_node("Bob", &network, |_| {}).await;
    let mut bob_events = bob.node.notifier.subscribe();

    let original = payload(64 * 1024);
    let mut flipped = original.clone();
    flipped[1000] ^= 0x01;

    let client = SecureTransport::new(network.join());
    let addr = ([127, 0, 0, 1], bob.node.port()).into();
    let mut stream = client.connect(addr).await.unwrap();
    let sender = NodeId::new().to_string();
    Preamble::write_to(&mut stream, &sender, FrameKind::File)
        .await
        .unwrap();
    FileHeader {
        file_name: "ledger.db".into(),
        total_size: flipped.len() as u64,
        metadata: String::new(),
        hash: hash(&original),
        tags: String::new(),
    }
    .write_to(&mut stream)
    .await
    .unwrap();
    stream.write_all(&flipped).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(stream.read_u8().await.unwrap(), ACK_INTEGRITY);
    let _ = stream.finish().await;

    wait_for(&mut bob_events, |n| {
        *n == Notification::IntegrityFailed {
            file: "ledger.db".into(),
        }
    })
    .await;
    assert!(!bob.save_dir().join("ledger.db").exists());
    assert!(part_files(&bob.save_dir()).is_empty());
    let transfers = bob.node.journal.with(|db| db.list_transfers()).unwrap();
    assert!(transfers.is_empty());
}

#[tokio::test]
async fn test_unsafe_file_name_is_refused() {
    let network = Keystore::generate();
    let bob = start_node("Bob", &network, |_| {}).await;

    let body = b"owned".to_vec();
    let client = SecureTransport::new(network.join());
    let mut stream = client
        .connect(([127, 0, 0, 1], bob.node.port()).into())
        .await
        .unwrap();
    Preamble::write_to(&mut stream, &NodeId::new().to_string(), FrameKind::File)
        .await
        .unwrap();
    FileHeader {
        file_name: "../escape.sh".into(),
        total_size: body.len() as u64,
        metadata: String::new(),
        hash: hash(&body),
        tags: String::new(),
    }
    .write_to(&mut stream)
    .await
    .unwrap();
    stream.write_all(&body).await.unwrap();
    stream.flush().await.unwrap();

    assert_eq!(stream.read_u8().await.unwrap(), ACK_REJECTED);
    assert!(!bob.dir.path().join("escape.sh").exists());
}

#[tokio::test]
async fn test_overwrite_keeps_previous_version() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |_| {}).await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);

    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    tokio::fs::write(first.path().join("notes.txt"), b"draft one")
        .await
        .unwrap();
    tokio::fs::write(second.path().join("notes.txt"), b"draft two, longer")
        .await
        .unwrap();

    let transfers = &alice.node.transfers;
    transfers
        .send_file(&peer, &first.path().join("notes.txt"), "")
        .await
        .unwrap();
    assert!(bob.node.transfers.versions().unwrap().is_empty());

    transfers
        .send_file(&peer, &second.path().join("notes.txt"), "")
        .await
        .unwrap();

    let dest = bob.save_dir().join("notes.txt");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"draft two, longer");

    let versions = bob.node.transfers.versions().unwrap();
    assert_eq!(versions.len(), 1);
    let version = &versions[0];
    assert_eq!(version.file_name, "notes.txt");
    assert!(version.version_label.starts_with("notes.txt.v"));
    assert_eq!(version.size, 9);
    assert_eq!(version.hash, hash(b"draft one"));
    let kept = bob.save_dir().join(&version.version_label);
    assert_eq!(tokio::fs::read(&kept).await.unwrap(), b"draft one");

    let restored = bob
        .node
        .transfers
        .restore_version(&version.version_label)
        .await
        .unwrap();
    assert_eq!(restored, dest);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"draft one");

    let activities = bob.node.journal.with(|db| db.list_activities()).unwrap();
    assert!(activities
        .iter()
        .any(|a| a.action == format!("Restored file version: {} to notes.txt", version.version_label)));
}

#[tokio::test]
async fn test_concurrent_same_name_receives_stay_intact() {
    let network = Keystore::generate();
    let paced = |o: &mut NodeOptions| o.bandwidth = BandwidthMode::Fixed(256 * 1024);
    let alice = start_node("Alice", &network, paced).await;
    let carol = start_node("Carol", &network, paced).await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let to_bob_from_alice = alice.add_peer(&bob);
    let to_bob_from_carol = carol.add_peer(&bob);

    let alice_dir = tempfile::tempdir().unwrap();
    let carol_dir = tempfile::tempdir().unwrap();
    let alice_src = alice_dir.path().join("notes.txt");
    let carol_src = carol_dir.path().join("notes.txt");
    let alice_bytes = vec![b'A'; 256 * 1024];
    let carol_bytes = vec![b'C'; 256 * 1024];
    tokio::fs::write(&alice_src, &alice_bytes).await.unwrap();
    tokio::fs::write(&carol_src, &carol_bytes).await.unwrap();

    let from_alice = alice.node.transfers.send_file(&to_bob_from_alice, &alice_src, "");
    let from_carol = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        carol
            .node
            .transfers
            .send_file(&to_bob_from_carol, &carol_src, "")
            .await
    };
    let (alice_result, carol_result) = tokio::join!(from_alice, from_carol);
    alice_result.unwrap();
    carol_result.unwrap();

    let dest = tokio::fs::read(bob.save_dir().join("notes.txt")).await.unwrap();
    let versions = bob.node.transfers.versions().unwrap();
    assert_eq!(versions.len(), 1);
    let kept = tokio::fs::read(bob.save_dir().join(&versions[0].version_label))
        .await
        .unwrap();

    // one upload is current, the other is the kept version, neither mixed
    let mut contents = vec![dest, kept];
    contents.sort();
    assert_eq!(contents, vec![alice_bytes, carol_bytes]);
    assert!(part_files(&bob.save_dir()).is_empty());
    assert_eq!(
        bob.node.journal.with(|db| db.list_transfers()).unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_declined_file_is_never_written() {
    let network = Keystore::generate();
    let asked = Arc::new(ScriptedConfirmer::new(false));
    let confirmer: Arc<dyn ReceiveConfirmer> = asked.clone();
    let alice = start_node("Alice", &network, |_| {}).await;
    let bob = start_node("Bob", &network, move |o| {
        o.transfer.auto_accept = false;
        o.receive_confirmer = confirmer;
    })
    .await;
    let peer = alice.add_peer(&bob);
    let mut bob_events = bob.node.notifier.subscribe();

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("unsolicited.exe");
    tokio::fs::write(&src, payload(128 * 1024)).await.unwrap();

    let err = alice
        .node
        .transfers
        .send_file(&peer, &src, "")
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Rejected(_)));

    wait_for(&mut bob_events, |n| {
        *n == Notification::TransferDeclined {
            file: "unsolicited.exe".into(),
            from: alice.id(),
        }
    })
    .await;
    assert_eq!(
        *asked.asked.lock().unwrap(),
        vec![(alice.id(), "unsolicited.exe".to_string())]
    );
    assert!(!bob.save_dir().join("unsolicited.exe").exists());
    assert!(part_files(&bob.save_dir()).is_empty());
    assert!(bob.node.journal.with(|db| db.list_transfers()).unwrap().is_empty());
}

#[tokio::test]
async fn test_confirmed_file_is_stored() {
    let network = Keystore::generate();
    let asked = Arc::new(ScriptedConfirmer::new(true));
    let confirmer: Arc<dyn ReceiveConfirmer> = asked.clone();
    let alice = start_node("Alice", &network, |_| {}).await;
    let bob = start_node("Bob", &network, move |o| {
        o.transfer.auto_accept = false;
        o.receive_confirmer = confirmer;
    })
    .await;
    let peer = alice.add_peer(&bob);

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("slides.pdf");
    tokio::fs::write(&src, payload(4096)).await.unwrap();

    let report = alice
        .node
        .transfers
        .send_file(&peer, &src, "")
        .await
        .unwrap();
    assert_eq!(asked.asked.lock().unwrap().len(), 1);
    assert_eq!(
        hash_file(&bob.save_dir().join("slides.pdf")).await.unwrap(),
        report.hash
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() {
    let network = Keystore::generate();
    let flaky = Arc::new(FlakyDialer::new(network.join(), 1));
    let dialer: Arc<dyn Dialer> = flaky.clone();
    let alice = start_node("Alice", &network, move |o| o.dialer = Some(dialer)).await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("report.zip");
    tokio::fs::write(&src, payload(10 * 1024 * 1024)).await.unwrap();

    let report = alice
        .node
        .transfers
        .send_file(&peer, &src, "finance,q3")
        .await
        .unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(flaky.dials.load(Ordering::SeqCst), 2);
    assert_eq!(
        hash_file(&bob.save_dir().join("report.zip")).await.unwrap(),
        report.hash
    );

    for (node, direction) in [(&alice, Direction::Sent), (&bob, Direction::Received)] {
        let transfers = node.node.journal.with(|db| db.list_transfers()).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].file_name, "report.zip");
        assert_eq!(transfers[0].direction, direction);
        assert_eq!(transfers[0].size, 10 * 1024 * 1024);
        assert!(transfers[0].metadata.starts_with("Size: 10485760 bytes"));

        let tags = node.node.journal.with(|db| db.list_tags()).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tags, "finance,q3");
    }
}

#[tokio::test]
async fn test_directory_is_sent_as_archive() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |_| {}).await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);

    let src_dir = tempfile::tempdir().unwrap();
    let album = src_dir.path().join("album");
    tokio::fs::create_dir_all(album.join("raw")).await.unwrap();
    tokio::fs::write(album.join("cover.jpg"), b"jpeg").await.unwrap();
    tokio::fs::write(album.join("raw/001.cr2"), payload(4096))
        .await
        .unwrap();

    let report = alice
        .node
        .transfers
        .send_file(&peer, &album, "")
        .await
        .unwrap();
    assert_eq!(report.file_name, "album.zip");
    assert!(bob.save_dir().join("album.zip").exists());

    // staged archive is gone once the job ends
    let staging = alice.dir.path().join("staging");
    let leftovers = std::fs::read_dir(&staging)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_rate_limit_paces_transfer() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |o| {
        o.bandwidth = BandwidthMode::Fixed(256 * 1024)
    })
    .await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("big.iso");
    tokio::fs::write(&src, payload(512 * 1024)).await.unwrap();

    let started = Instant::now();
    alice
        .node
        .transfers
        .send_file(&peer, &src, "")
        .await
        .unwrap();
    // 512 KiB at 256 KiB/s
    assert!(started.elapsed() >= Duration::from_millis(1900));
}

#[tokio::test]
async fn test_cancel_stops_running_transfer() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |o| {
        o.bandwidth = BandwidthMode::Fixed(64 * 1024)
    })
    .await;
    let bob = start_node("Bob", &network, |_| {}).await;
    let peer = alice.add_peer(&bob);
    let mut alice_events = alice.node.notifier.subscribe();

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("movie.mkv");
    tokio::fs::write(&src, payload(1024 * 1024)).await.unwrap();

    let transfers = alice.node.transfers.clone();
    let ids = transfers.submit(&peer, &[src], "").await.unwrap();
    assert_eq!(ids.len(), 1);
    let id = ids[0];

    assert!(
        eventually(|| {
            transfers
                .job(id)
                .map(|j| j.state == JobState::InProgress && j.progress > 0.0)
                .unwrap_or(false)
        })
        .await
    );

    assert!(transfers.cancel(id));
    assert!(transfers.job(id).is_none());
    assert!(!transfers.cancel(id));
    wait_for(&mut alice_events, |n| {
        *n == Notification::TransferCancelled {
            file: "movie.mkv".into(),
        }
    })
    .await;

    let bob_save = bob.save_dir();
    assert!(eventually(|| part_files(&bob_save).is_empty()).await);
    assert!(!bob_save.join("movie.mkv").exists());
    assert!(eventually(|| bob.node.transfers.jobs().is_empty()).await);
}

#[tokio::test]
async fn test_unknown_peer_is_reported() {
    let network = Keystore::generate();
    let alice = start_node("Alice", &network, |_| {}).await;

    let src_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("a.txt");
    tokio::fs::write(&src, b"a").await.unwrap();

    let err = alice
        .node
        .transfers
        .send_file("Nobody", &src, "")
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::UnknownPeer(name) if name == "Nobody"));
}
