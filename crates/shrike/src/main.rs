//
// main.rs
//

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use shrike::baseline::GitBaselineSource;
use shrike::config_snapshot::ConfigVersionTracker;
use shrike::document::Document;
use shrike::engine::{AnalysisEngine, DEFAULT_ENGINE_BINARY};
use shrike::review_cache::ReviewCache;
use shrike::reviewer::Reviewer;
use shrike::stats::ExecutionStats;

fn print_usage() {
    println!(
        "shrike {}, a code-health analysis core.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: shrike [OPTIONS]

Available options:

--review <FILE>              Analyze one file and print the result as JSON
--engine <PATH>              Path to the analysis engine binary
                             (default: `code-health` on PATH)
--version                    Print the version
--help                       Print this help message

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut engine_binary = PathBuf::from(DEFAULT_ENGINE_BINARY);
    let mut review_target: Option<PathBuf> = None;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--engine" => {
                let Some(path) = argv.next() else {
                    return Err(anyhow::anyhow!("--engine requires a path"));
                };
                engine_binary = PathBuf::from(path);
            }
            "--review" => {
                let Some(path) = argv.next() else {
                    return Err(anyhow::anyhow!("--review requires a file"));
                };
                review_target = Some(PathBuf::from(path));
            }
            "--version" => {
                println!("shrike {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    let Some(target) = review_target else {
        print_usage();
        return Ok(());
    };

    env_logger::init();

    let target = target
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Cannot open {}: {}", target.display(), e))?;
    let text = std::fs::read_to_string(&target)?;

    let tracker = Arc::new(ConfigVersionTracker::new());
    if let Some(dir) = target.parent() {
        tracker.discover(dir);
    }

    let engine = Arc::new(AnalysisEngine::new(
        engine_binary,
        Arc::new(ExecutionStats::new()),
    ));
    let baselines = Arc::new(GitBaselineSource::new(engine.clone()));
    let cache = Arc::new(ReviewCache::new(tracker, baselines));
    let reviewer = Reviewer::new(engine.clone(), cache);

    let doc = Document::new(&target, 0, text);
    let review = reviewer.review(&doc).await?;
    println!("{}", serde_json::to_string_pretty(review.as_ref())?);

    if let Some(entry) = reviewer.cache().get(&doc) {
        if let Some(delta) = entry.delta {
            println!(
                "// score {:+.2} against baseline {:.2}",
                delta.value(),
                delta.baseline
            );
        }
    }

    engine.report_stats();
    Ok(())
}
