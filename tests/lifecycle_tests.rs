mod common;

use common::{loopback, settle, test_config, MASK};
use crabdcc::config::SessionLimits;
use crabdcc::dcc::{CreateOptions, DccError, DccType, Dispatcher, Role};
use std::time::Duration;

#[tokio::test]
async fn test_unanswered_offer_times_out() {
    let mut config = test_config();
    config.chat = SessionLimits {
        accept_timeout: 1,
        ..SessionLimits::default()
    };
    let (manager, mut loopback) = loopback(config, Dispatcher::new());

    let handle = manager
        .create(DccType::Chat, MASK, CreateOptions::offer())
        .unwrap();
    let _ = loopback.next_offer().await;
    assert!(manager.is_pending(handle.key()));

    assert!(matches!(settle(handle.ready()).await, Err(DccError::OfferTimeout)));
    assert!(matches!(settle(handle.closed()).await, Err(DccError::OfferTimeout)));
    assert!(matches!(settle(handle.started()).await, Err(DccError::OfferTimeout)));
    assert!(manager.list(DccType::Chat, MASK).is_empty());
    assert!(manager.get(handle.key()).is_none());
}

#[tokio::test]
async fn test_accept_timeout_override() {
    let (manager, _loopback) = loopback(test_config(), Dispatcher::new());
    let handle = manager
        .create(
            DccType::Chat,
            MASK,
            CreateOptions::offer().accept_timeout(Duration::from_millis(200)),
        )
        .unwrap();
    assert!(matches!(settle(handle.closed()).await, Err(DccError::OfferTimeout)));
}

#[tokio::test]
async fn test_idle_timeout_rearms_on_traffic() {
    let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());

    let quiet = manager
        .create(
            DccType::Chat,
            MASK,
            CreateOptions::offer().idle_timeout(Duration::from_millis(600)),
        )
        .unwrap();
    let offer = loopback.next_offer().await;
    let chatty = manager
        .create(
            DccType::Chat,
            MASK,
            offer.options().idle_timeout(Duration::from_secs(30)),
        )
        .unwrap();
    settle(quiet.ready()).await.unwrap();
    settle(chatty.ready()).await.unwrap();

    // Five lines 200ms apart keep the 600ms deadline moving
    for i in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        chatty.send_line(format!("line {i}")).unwrap();
    }
    assert!(!quiet.is_closed());
    assert!(!manager.is_pending(quiet.key()));

    assert!(matches!(
        settle(quiet.closed()).await,
        Err(DccError::IdleTimeout(d)) if d == Duration::from_millis(600)
    ));
    assert!(settle(chatty.closed()).await.is_ok());
    assert!(manager.list(DccType::Chat, MASK).is_empty());
}

#[tokio::test]
async fn test_closed_resolves_once() {
    let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());

    let offering = manager
        .create(DccType::Chat, MASK, CreateOptions::offer())
        .unwrap();
    let offer = loopback.next_offer().await;
    let accepting = manager.create(DccType::Chat, MASK, offer.options()).unwrap();
    settle(offering.ready()).await.unwrap();
    settle(accepting.ready()).await.unwrap();

    offering.close();
    offering.close();
    assert!(matches!(settle(offering.closed()).await, Err(DccError::Cancelled)));
    offering.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(offering.closed().get(), Some(Err(DccError::Cancelled))));
    assert!(offering.is_closed());

    // The peer hung up before a single line went through
    assert!(matches!(
        settle(accepting.closed()).await,
        Err(DccError::Transport(_))
    ));
    assert!(matches!(accepting.started().get(), Some(Err(DccError::Transport(_)))));
    assert!(matches!(
        offering.send_line("too late"),
        Err(DccError::InvalidRequest(_))
    ));
    assert!(manager.list(DccType::Chat, MASK).is_empty());
}

#[tokio::test]
async fn test_refused_dial_fails_session() {
    let (manager, _loopback) = loopback(test_config(), Dispatcher::new());
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let handle = manager
        .create(
            DccType::Chat,
            MASK,
            CreateOptions::dial(([127, 0, 0, 1], port).into()),
        )
        .unwrap();
    assert_eq!(handle.key().id.role, Role::Accepting);
    assert!(matches!(settle(handle.ready()).await, Err(DccError::Transport(_))));
    assert!(matches!(settle(handle.closed()).await, Err(DccError::Transport(_))));
    assert!(manager.list(DccType::Chat, MASK).is_empty());
}

#[tokio::test]
async fn test_close_while_waiting_for_accept() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _loopback) = loopback(test_config(), Dispatcher::new());

    let handle = manager
        .create(
            DccType::Send,
            MASK,
            CreateOptions::dial(([127, 0, 0, 1], 9).into())
                .filepath(dir.path().join("dst"))
                .filename("dst")
                .size(100)
                .resume(true),
        )
        .unwrap();
    assert!(manager.is_pending(handle.key()));

    handle.close();
    assert!(matches!(settle(handle.closed()).await, Err(DccError::Cancelled)));
    assert!(matches!(handle.ready().get(), Some(Err(DccError::Cancelled))));
    assert!(!manager.resume(MASK, "dst", 9, 10));
}

#[tokio::test]
async fn test_registry_tracks_each_mask() {
    let (manager, _loopback) = loopback(test_config(), Dispatcher::new());

    let first = manager
        .create(DccType::Chat, MASK, CreateOptions::offer())
        .unwrap();
    let second = manager
        .create(DccType::Chat, MASK, CreateOptions::offer())
        .unwrap();
    let other = manager
        .create(DccType::Chat, "bearstech", CreateOptions::offer())
        .unwrap();

    let mut ids = manager.list(DccType::Chat, MASK);
    ids.sort_by_key(|id| id.port);
    let mut expected = vec![first.key().id, second.key().id];
    expected.sort_by_key(|id| id.port);
    assert_eq!(ids, expected);
    assert_eq!(manager.list(DccType::Chat, "bearstech"), vec![other.key().id]);
    assert!(manager.list(DccType::Send, MASK).is_empty());

    first.close();
    settle(first.closed()).await.unwrap_err();
    assert_eq!(manager.list(DccType::Chat, MASK), vec![second.key().id]);
    assert!(manager.get(second.key()).is_some());

    second.close();
    other.close();
    settle(second.closed()).await.unwrap_err();
    settle(other.closed()).await.unwrap_err();
    assert!(manager.list(DccType::Chat, MASK).is_empty());
    assert!(manager.list(DccType::Chat, "bearstech").is_empty());
}

#[tokio::test]
async fn test_stalled_transfer_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let src = common::write_source(dir.path());
    let (manager, mut loopback) = loopback(test_config(), Dispatcher::new());

    let sender = manager
        .create(
            DccType::Send,
            MASK,
            CreateOptions::offer()
                .filepath(&src)
                .idle_timeout(Duration::from_millis(500)),
        )
        .unwrap();
    let offer = loopback.next_offer().await;

    // Connects, then never reads or acknowledges
    let _peer = tokio::net::TcpStream::connect(offer.addr).await.unwrap();
    settle(sender.ready()).await.unwrap();

    assert!(matches!(
        settle(sender.closed()).await,
        Err(DccError::IdleTimeout(d)) if d == Duration::from_millis(500)
    ));
    assert!(manager.list(DccType::Send, MASK).is_empty());
}
