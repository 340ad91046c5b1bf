use anyhow::bail;
use clap::Parser;
use human_bytes::human_bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

use ul_nzb::cli::Cli;
use ul_nzb::config::PostConfig;
use ul_nzb::error::PostError;
use ul_nzb::nntp::{generate_nonce, EngineOptions, PostingEngine, StatOutcome};
use ul_nzb::post::{nzb, FileSet, SegmentKey};
use ul_nzb::progress::{self, ProgressStyle};
use ul_nzb::yenc;

/// What we know about a piece once the server accepted it.
#[derive(Debug, Clone)]
struct PostedSegment {
    /// Last message-id the piece went out under (brackets included).
    message_id: String,
    /// Encoded payload size, as recorded in the NZB.
    bytes: u64,
}

type PostedMap = Arc<Mutex<HashMap<SegmentKey, PostedSegment>>>;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = PostConfig::load(&cli)?;
    run(config)
}

fn run(config: PostConfig) -> anyhow::Result<()> {
    let mut fileset = FileSet::new(config.article_size, yenc::DEFAULT_LINE_LENGTH);
    for path in &config.files {
        let pieces = fileset.add_file(path)?;
        if pieces == 0 {
            tracing::warn!("{} is empty; nothing to post for it", path.display());
        }
    }

    let total_pieces = fileset.total_pieces();
    if total_pieces == 0 {
        bail!("nothing to post");
    }

    println!(
        "📦 {} file(s) • {} • {} pieces of {} bytes • {} group(s)",
        fileset.file_count(),
        human_bytes(fileset.total_bytes() as f64),
        total_pieces,
        config.article_size,
        config.groups.len(),
    );

    let nonce = generate_nonce();
    tracing::info!("using run nonce {nonce}");

    let posted: PostedMap = Arc::new(Mutex::new(HashMap::new()));
    let keys: Vec<SegmentKey> = fileset.keys().collect();
    let started = Instant::now();

    let post_result = post_pass(&config, &mut fileset, &keys, &nonce, &posted);

    let validate_result = if config.validate && post_result.is_ok() {
        validate_posts(&config, &mut fileset, &posted)
    } else {
        Ok(())
    };

    // Record whatever made it to the servers, even after a partial run.
    write_nzb(&config, &fileset, &posted)?;

    let (posted_count, posted_bytes) = {
        let posted = posted.lock().unwrap();
        (
            posted.len() as u64,
            posted.values().map(|s| s.bytes).sum::<u64>(),
        )
    };
    println!(
        "{}",
        progress::format_post_summary(posted_count, total_pieces, posted_bytes, started.elapsed())
    );

    post_result?;
    validate_result?;
    if posted_count < total_pieces {
        return Err(PostError::SegmentsFailed {
            failed: (total_pieces - posted_count) as usize,
            total: total_pieces as usize,
        }
        .into());
    }
    Ok(())
}

fn engine_options(config: &PostConfig) -> EngineOptions {
    EngineOptions {
        io_threads: config.io_threads,
        max_queue_size: config.queue_size,
        max_retries: config.max_retries,
        op_timeout: config.operation_timeout,
        msgid_domain: config.msgid_domain.clone(),
        dump_dir: PathBuf::from("."),
    }
}

/// Post the given pieces, blocking until the engine drains.
fn post_pass(
    config: &PostConfig,
    fileset: &mut FileSet,
    keys: &[SegmentKey],
    nonce: &str,
    posted: &PostedMap,
) -> anyhow::Result<()> {
    let bar = progress::create_progress_bar(keys.len() as u64, ProgressStyle::Post);
    let bytes_posted = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let mut engine = PostingEngine::builder(engine_options(config))
        .post_finished({
            let posted = Arc::clone(posted);
            let bytes_posted = Arc::clone(&bytes_posted);
            let bar = bar.clone();
            move |article| {
                let Some(key) = article.segment_key() else {
                    return;
                };
                let bytes = article.payload_size() as u64;
                posted.lock().unwrap().insert(
                    key,
                    PostedSegment {
                        message_id: article.message_id().to_string(),
                        bytes,
                    },
                );
                let total = bytes_posted.fetch_add(bytes, Ordering::SeqCst) + bytes;
                bar.set_message(progress::speed_message(total, started.elapsed()));
                bar.inc(1);
            }
        })
        .post_failed(|article| {
            tracing::warn!("server rejected \"{}\"", article.subject());
        })
        .build();

    engine.start()?;
    for server in &config.servers {
        engine.add_connections(server.clone(), server.connections)?;
    }

    for &key in keys {
        let message_id = key.message_id(nonce, &config.msgid_domain);
        let article =
            fileset.build_article(key, message_id, &config.from, &config.subject, &config.groups)?;
        if let Err(e) = engine.enqueue_post(Arc::new(article), false) {
            tracing::error!("abandoning the rest of the batch: {e}");
            break;
        }
    }

    engine.stop();
    engine.join();
    bar.finish_and_clear();

    if let Some(cause) = engine.abort_cause() {
        return Err(cause.into());
    }
    Ok(())
}

/// STAT every posted piece; repost anything the servers do not have.
fn validate_posts(
    config: &PostConfig,
    fileset: &mut FileSet,
    posted: &PostedMap,
) -> anyhow::Result<()> {
    for attempt in 0..=config.max_retries {
        let missing = stat_pass(config, posted)?;
        if missing.is_empty() {
            println!("✓ all pieces verified on the server");
            return Ok(());
        }

        tracing::warn!("{} piece(s) not found on the server", missing.len());
        if attempt == config.max_retries {
            return Err(PostError::SegmentsFailed {
                failed: missing.len(),
                total: posted.lock().unwrap().len(),
            }
            .into());
        }

        let nonce = generate_nonce();
        tracing::info!("reposting {} piece(s) with nonce {nonce}", missing.len());
        post_pass(config, fileset, &missing, &nonce, posted)?;
    }
    Ok(())
}

/// One STAT sweep over the last-known message-ids. Returns the keys the
/// servers claim not to have.
fn stat_pass(config: &PostConfig, posted: &PostedMap) -> anyhow::Result<Vec<SegmentKey>> {
    let mut targets: Vec<(SegmentKey, String)> = posted
        .lock()
        .unwrap()
        .iter()
        .map(|(key, segment)| (*key, segment.message_id.clone()))
        .collect();
    targets.sort_by_key(|(key, _)| *key);

    let bar = progress::create_progress_bar(targets.len() as u64, ProgressStyle::Validate);
    bar.set_message("verifying");

    let results: Arc<Mutex<HashMap<String, StatOutcome>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut engine = PostingEngine::builder(engine_options(config))
        .stat_finished({
            let results = Arc::clone(&results);
            let bar = bar.clone();
            move |message_id, outcome| {
                results
                    .lock()
                    .unwrap()
                    .insert(message_id.to_string(), outcome);
                bar.inc(1);
            }
        })
        .build();

    engine.start()?;
    for server in &config.servers {
        engine.add_connections(server.clone(), server.connections)?;
    }
    for (_, message_id) in &targets {
        if let Err(e) = engine.enqueue_stat(message_id.clone()) {
            tracing::error!("abandoning validation: {e}");
            break;
        }
    }
    engine.stop();
    engine.join();
    bar.finish_and_clear();

    if let Some(cause) = engine.abort_cause() {
        return Err(cause.into());
    }

    let results = results.lock().unwrap();
    Ok(targets
        .into_iter()
        .filter(|(_, message_id)| results.get(message_id) != Some(&StatOutcome::Exists))
        .map(|(key, _)| key)
        .collect())
}

/// Emit the manifest for everything that was actually posted.
fn write_nzb(config: &PostConfig, fileset: &FileSet, posted: &PostedMap) -> anyhow::Result<()> {
    let Some(output) = &config.nzb_output else {
        tracing::info!("no --output given; skipping the NZB manifest");
        return Ok(());
    };

    let date = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let posted = posted.lock().unwrap();

    let mut files = Vec::new();
    for file_index in 0..fileset.file_count() as u32 {
        let pieces = fileset.piece_count(file_index);
        if pieces == 0 {
            continue;
        }

        let mut segments = Vec::new();
        for piece_index in 0..pieces {
            let key = SegmentKey::new(file_index, piece_index);
            match posted.get(&key) {
                Some(segment) => segments.push(nzb::NzbSegment {
                    bytes: segment.bytes,
                    number: piece_index + 1,
                    message_id: segment
                        .message_id
                        .trim_start_matches('<')
                        .trim_end_matches('>')
                        .to_string(),
                }),
                None => tracing::warn!("piece {key} was never posted; omitted from the NZB"),
            }
        }

        files.push(nzb::NzbFile {
            poster: config.from.clone(),
            date,
            subject: fileset.subject(&config.subject, SegmentKey::new(file_index, 0)),
            groups: config.groups.clone(),
            segments,
        });
    }

    let path = nzb::resolve_output_path(output, &config.subject);
    nzb::write(&path, &files)?;
    println!("📄 NZB written to {}", path.display());
    Ok(())
}
