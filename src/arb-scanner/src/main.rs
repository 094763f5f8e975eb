//! Arbitrage Scanner Service
//!
//! Wires the catalog fetcher, feed connector, spread detector, window
//! consumer, persistence writer, subscription controller, and aggregator
//! into one cooperating pipeline of bounded-queue tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chrono::Utc;

use scanner_core::aggregator::Aggregator;
use scanner_core::catalog::{CatalogClient, CatalogFetcher, CatalogFilters};
use scanner_core::config::Config;
use scanner_core::consumer::{PendingCounter, WindowConsumer};
use scanner_core::db::Database;
use scanner_core::detector::{DetectorConfig, DetectorInput, DiscardedPendingCounter, LatencyHistogram, SpreadDetector};
use scanner_core::feed::{parse_message, FeedClient, FeedMessage};
use scanner_core::models::{PriceMessage, TokenId, WindowEvent};
use scanner_core::orderbook::{Level, Side};
use scanner_core::price::FixedPrice;
use scanner_core::repository::Repository;
use scanner_core::store::MarketStore;
use scanner_core::subscription::{select_pinned, FeedControl, PinnedWatcherConfig, SubscriptionController};
use scanner_core::writer::{PersistenceWriter, WriterQueue};

/// Real-time binary-market arbitrage scanner.
#[derive(Parser, Debug)]
#[command(name = "arb-scanner")]
#[command(about = "Scans binary prediction markets for YES/NO arbitrage windows")]
struct Args {
    /// Run one catalog refresh and exit, instead of looping forever.
    #[arg(long)]
    once: bool,

    /// Writer queue capacity (bounded but large).
    #[arg(long, default_value = "10000")]
    writer_queue_capacity: usize,

    /// Broadcast channel capacity for live window-event subscribers.
    #[arg(long, default_value = "1024")]
    broadcast_capacity: usize,
}

fn level_to_levelfilter(raw: &str) -> &'static str {
    match raw.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_levelfilter(&config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting arb-scanner");

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    let repo = Repository::new(db.pool().clone());

    let store = Arc::new(MarketStore::new());
    let histogram = LatencyHistogram::new();
    let discarded_pending = DiscardedPendingCounter::new();

    let (window_tx, window_rx) = mpsc::channel::<WindowEvent>(4096);
    let (detector_tx, detector_rx) = mpsc::channel::<DetectorInput>(8192);
    let (feed_control_tx, feed_control_rx) = mpsc::channel::<FeedControl>(256);
    let (broadcast_tx, _broadcast_rx) = broadcast::channel::<WindowEvent>(args.broadcast_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer_queue = Arc::new(WriterQueue::new(args.writer_queue_capacity));
    let pending = PendingCounter::new();

    let subscription = Arc::new(Mutex::new(SubscriptionController::new(
        store.clone(),
        feed_control_tx.clone(),
        detector_tx.clone(),
    )));

    // Persistence Writer (C7).
    let writer_handle = {
        let queue = writer_queue.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let writer = PersistenceWriter::new(repo.clone());
            writer.run(&queue, shutdown_rx).await;
        })
    };

    // Window Consumer (C6).
    let consumer_handle = {
        let queue = writer_queue.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            let mut consumer = WindowConsumer::new(window_rx, queue, broadcast_tx, pending);
            consumer.run().await;
        })
    };

    // Spread Detector (C4).
    let detector_handle = {
        let store = store.clone();
        let histogram = histogram.clone();
        let discarded_pending = discarded_pending.clone();
        let detector_config = DetectorConfig {
            min_arb_ticks: config.min_arb_ticks,
            min_combined_threshold: config.min_combined_threshold,
        };
        tokio::spawn(async move {
            let mut detector = SpreadDetector::new(store, detector_config, histogram, discarded_pending, window_tx);
            detector.run(detector_rx).await;
        })
    };

    // Feed Connector (C3).
    let feed_handle = {
        let store = store.clone();
        let subscription = subscription.clone();
        let detector_tx = detector_tx.clone();
        let feed_ws_url = config.feed_ws_url.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            run_feed_connector(feed_ws_url, store, subscription, detector_tx, feed_control_rx, &mut shutdown_rx).await;
        })
    };

    // Catalog Fetcher (C1) + Subscription Controller reconciliation (C8).
    let catalog_client = CatalogClient::new(config.catalog_api_url.clone());
    let filters = CatalogFilters {
        min_volume_24h: config.min_volume_24h,
        min_liquidity: config.min_liquidity,
        min_expiry: config.min_expiry,
        max_expiry: config.max_expiry,
    };
    let fetcher = Arc::new(CatalogFetcher::new(catalog_client, filters, Repository::new(db.pool().clone())));

    let catalog_handle = {
        let subscription = subscription.clone();
        let fetcher = fetcher.clone();
        let refresh_interval = config.catalog_refresh_interval;
        let once = args.once;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let desired = fetcher.refresh().await;
                        subscription.lock().await.reconcile(desired).await;
                        if once {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Pinned Market Watcher: faster-cadence pin/unpin pass over the catalog
    // fetcher's last desired set, to keep short-lifetime rolling market
    // families covered across rollovers.
    let pinned_handle = {
        let store = store.clone();
        let fetcher = fetcher.clone();
        let prefixes = config.pinned_market_prefixes.clone();
        let refresh_interval = config.pinned_refresh_interval;
        let once = args.once;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if prefixes.is_empty() {
                return;
            }
            let mut ticker = interval(refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let candidates = fetcher.last_desired();
                        let desired = select_pinned(&prefixes, &candidates, Utc::now(), PinnedWatcherConfig::default());
                        for id in store.pinned_ids() {
                            if !desired.contains(&id) {
                                store.unpin(id);
                            }
                        }
                        for id in desired {
                            store.pin(id);
                        }
                        if once {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Aggregator (C9).
    let aggregator_handle = {
        let repo = Repository::new(db.pool().clone());
        let discarded_pending = discarded_pending.clone();
        let interval_duration = config.aggregator_interval;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let aggregator = Aggregator::new(repo, discarded_pending);
            let mut ticker = interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = aggregator.run_once().await {
                            error!(error = %e, "aggregator pass failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    if args.once {
        let _ = catalog_handle.await;
        let _ = shutdown_tx.send(true);
    } else {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    }

    let _ = aggregator_handle.await;
    let _ = pinned_handle.await;
    let _ = feed_handle.await;
    let _ = detector_handle.await;
    let _ = consumer_handle.await;
    let _ = writer_handle.await;

    Ok(())
}

/// Outer reconnect loop for the Feed Connector: maintain one duplex stream,
/// resubscribe to the full watched set on every (re)connect, process
/// control messages between frame reads, and keep the backoff posture
/// described in the connector's design.
async fn run_feed_connector(
    ws_url: String,
    store: Arc<MarketStore>,
    subscription: Arc<Mutex<SubscriptionController>>,
    detector_tx: mpsc::Sender<DetectorInput>,
    mut control_rx: mpsc::Receiver<FeedControl>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let client = FeedClient::new(ws_url);

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let mut ws = client.connect_with_retry().await;
        let tokens = subscription.lock().await.all_tokens();
        if let Err(e) = client.subscribe(&mut ws, &tokens).await {
            warn!(error = %e, "initial subscribe failed, reconnecting");
            continue;
        }

        let mut keepalive = interval(client.keepalive_interval());
        keepalive.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            handle_frame(&text, &store, &detector_tx).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "feed stream error, reconnecting");
                            break;
                        }
                        None => {
                            warn!("feed stream closed, reconnecting");
                            break;
                        }
                    }
                }
                control = control_rx.recv() => {
                    match control {
                        Some(FeedControl::Subscribe(tokens)) => {
                            if let Err(e) = client.subscribe(&mut ws, &tokens).await {
                                warn!(error = %e, "subscribe frame failed");
                            }
                        }
                        Some(FeedControl::Unsubscribe(tokens)) => {
                            if let Err(e) = client.unsubscribe(&mut ws, &tokens).await {
                                warn!(error = %e, "unsubscribe frame failed");
                            }
                        }
                        None => {}
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = client.send_ping(&mut ws).await {
                        warn!(error = %e, "ping failed, reconnecting");
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_frame(text: &str, store: &Arc<MarketStore>, detector_tx: &mpsc::Sender<DetectorInput>) {
    let received_at = std::time::Instant::now();
    match parse_message(text) {
        FeedMessage::Book(book) => {
            apply_book(store, &book.asset_id, &book.asks, &book.bids);
            emit_price(store, &book.asset_id, received_at, false, false, detector_tx).await;
        }
        FeedMessage::Books(books) => {
            for book in books {
                apply_book(store, &book.asset_id, &book.asks, &book.bids);
                emit_price(store, &book.asset_id, received_at, false, false, detector_tx).await;
            }
        }
        FeedMessage::PriceChange(change) => {
            let mut touched: Vec<TokenId> = Vec::new();
            for entry in &change.price_changes {
                let (Some(side), Some(price), Some(size)) = (
                    Side::from_wire(&entry.side),
                    FixedPrice::parse(&entry.price),
                    entry.size.parse::<rust_decimal::Decimal>().ok(),
                ) else {
                    continue;
                };
                store.apply_book_changes(&entry.asset_id, &[(side, price, size)]);
                if !touched.contains(&entry.asset_id) {
                    touched.push(entry.asset_id.clone());
                }
            }
            for token in touched {
                emit_price(store, &token, received_at, false, true, detector_tx).await;
            }
        }
        FeedMessage::Trade(trade) => {
            emit_price(store, &trade.asset_id, received_at, true, false, detector_tx).await;
        }
        FeedMessage::Ack | FeedMessage::Unrecognised => {}
    }
}

fn apply_book(store: &Arc<MarketStore>, token: &TokenId, asks: &[scanner_core::feed::WireLevel], bids: &[scanner_core::feed::WireLevel]) {
    let parsed_asks: Vec<Level> = asks
        .iter()
        .filter_map(|l| Some(Level { price: FixedPrice::parse(&l.price)?, size: l.size_decimal()? }))
        .collect();
    let parsed_bids: Vec<Level> = bids
        .iter()
        .filter_map(|l| Some(Level { price: FixedPrice::parse(&l.price)?, size: l.size_decimal()? }))
        .collect();
    store.apply_book_snapshot(token, &parsed_asks, &parsed_bids);
}

async fn emit_price(
    store: &Arc<MarketStore>,
    token: &TokenId,
    received_at: std::time::Instant,
    trade_fired: bool,
    volume_changed: bool,
    detector_tx: &mpsc::Sender<DetectorInput>,
) {
    let (Some(best_ask), Some(best_bid)) = (store.best_ask(token), store.best_bid(token)) else {
        return;
    };
    let msg = PriceMessage {
        token_id: token.clone(),
        best_ask,
        best_bid,
        received_at,
        trade_fired,
        volume_changed,
    };
    if detector_tx.send(DetectorInput::Price(msg)).await.is_err() {
        warn!("detector channel closed; dropping price message");
    }
}
