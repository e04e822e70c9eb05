mod common;

use common::{loopback, settle, test_config, write_source, MASK};
use crabdcc::dcc::{CreateOptions, DccError, DccType, Dispatcher, SendStrategy};
use std::time::{Duration, Instant};

const STRATEGIES: [SendStrategy; 2] = [SendStrategy::Buffered, SendStrategy::ZeroCopy];

#[tokio::test]
async fn test_send_is_byte_identical() {
    for strategy in STRATEGIES {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source(dir.path());
        let dst = dir.path().join("dst");
        let size = std::fs::metadata(&src).unwrap().len();

        let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());
        let sender = manager
            .create(
                DccType::Send,
                MASK,
                CreateOptions::offer().filepath(&src).strategy(strategy),
            )
            .unwrap();

        let offer = loopback.next_offer().await;
        assert_eq!(offer.filename.as_deref(), Some("src"));
        assert_eq!(offer.size, Some(size));

        let receiver = manager
            .create(DccType::Send, MASK, offer.options().filepath(&dst))
            .unwrap();

        settle(receiver.closed()).await.unwrap();
        settle(sender.closed()).await.unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap(), "{strategy:?}");
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), size);
        assert_eq!(sender.offset(), size);
        assert_eq!(receiver.offset(), size);
        assert!(manager.list(DccType::Send, MASK).is_empty());
    }
}

#[tokio::test]
async fn test_rate_limited_send() {
    for strategy in STRATEGIES {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source(dir.path());
        let dst = dir.path().join("dst");

        let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());
        let started = Instant::now();
        let sender = manager
            .create(
                DccType::Send,
                MASK,
                CreateOptions::offer()
                    .filepath(&src)
                    .strategy(strategy)
                    .limit_rate(64 * 65536),
            )
            .unwrap();
        let offer = loopback.next_offer().await;
        let receiver = manager
            .create(DccType::Send, MASK, offer.options().filepath(&dst))
            .unwrap();

        settle(receiver.closed()).await.unwrap();
        settle(sender.closed()).await.unwrap();

        // 3145737 bytes at 4 MiB/s
        assert!(
            started.elapsed() >= Duration::from_millis(700),
            "{strategy:?} took {:?}",
            started.elapsed()
        );
        assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap());
    }
}

#[tokio::test]
async fn test_resume_completes_partial_file() {
    for strategy in STRATEGIES {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source(dir.path());
        let dst = dir.path().join("dst");
        let source = std::fs::read(&src).unwrap();
        std::fs::write(&dst, &source[..1345]).unwrap();

        let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());
        let sender = manager
            .create(
                DccType::Send,
                MASK,
                CreateOptions::offer().filepath(&src).strategy(strategy),
            )
            .unwrap();
        let offer = loopback.next_offer().await;
        let port = offer.addr.port();

        let receiver = manager
            .create(
                DccType::Send,
                MASK,
                offer.options().filepath(&dst).resume(true),
            )
            .unwrap();
        assert_eq!(receiver.offset(), 1345);
        assert!(manager.resume(MASK, "src", port, receiver.offset()));

        settle(receiver.closed()).await.unwrap();
        settle(sender.closed()).await.unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), source, "{strategy:?}");
        assert_eq!(sender.offset(), source.len() as u64);

        let sent = loopback.sent();
        assert!(sent.contains(&format!("DCC RESUME src {port} 1345")));
        assert!(sent.contains(&format!("DCC ACCEPT src {port} 1345")));
    }
}

#[tokio::test]
async fn test_resume_with_short_partial_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path());
    let dst = dir.path().join("dst");
    std::fs::write(&dst, &std::fs::read(&src).unwrap()[..1000]).unwrap();

    let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());
    let sender = manager
        .create(DccType::Send, MASK, CreateOptions::offer().filepath(&src))
        .unwrap();
    let offer = loopback.next_offer().await;
    let receiver = manager
        .create(
            DccType::Send,
            MASK,
            offer.options().filepath(&dst).resume(true),
        )
        .unwrap();
    assert_eq!(receiver.offset(), 1000);
    assert!(manager.resume(MASK, "src", offer.addr.port(), 1345));

    assert!(matches!(
        settle(receiver.closed()).await,
        Err(DccError::ResumeMismatch {
            expected: 1345,
            actual: 1000
        })
    ));
    assert!(matches!(
        settle(sender.closed()).await,
        Err(DccError::Transport(_))
    ));
    assert_eq!(std::fs::metadata(&dst).unwrap().len(), 1000);
    assert!(manager.list(DccType::Send, MASK).is_empty());
}

#[tokio::test]
async fn test_resume_beyond_end_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path());

    let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());
    let sender = manager
        .create(DccType::Send, MASK, CreateOptions::offer().filepath(&src))
        .unwrap();
    let offer = loopback.next_offer().await;
    let port = offer.addr.port();

    assert!(manager
        .handle_ctcp(MASK, &format!("DCC RESUME src {port} 99999999"))
        .is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!loopback.sent().iter().any(|l| l.starts_with("DCC ACCEPT")));
    assert!(manager.is_pending(sender.key()));

    sender.close();
    assert!(matches!(settle(sender.closed()).await, Err(DccError::Cancelled)));
}
