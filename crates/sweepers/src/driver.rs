//! Sequence the sweepers. Each runs to completion; one sweeper's failure is
//! logged and the rest still run, but any failure makes the whole run fail.

use std::{
    future::Future,
    time::{
        Duration,
        Instant,
    },
};

use common::knobs::SWEEPERS_ENABLE_REINDEXER;

use crate::{
    ancestry,
    context::Context,
    provenance,
    reindexer,
    repairkit,
};

pub async fn run_sweepers(ctx: &Context) -> anyhow::Result<()> {
    let begin = Instant::now();
    let mut failures: Vec<&'static str> = Vec::new();

    run_one("repairkit", repairkit::run(ctx), &mut failures).await;
    run_one("provenance", provenance::run(ctx), &mut failures).await;
    run_one("ancestry", ancestry::run(ctx), &mut failures).await;
    if *SWEEPERS_ENABLE_REINDEXER {
        run_one("reindexer", reindexer::run(ctx), &mut failures).await;
    } else {
        tracing::debug!("Reindexer sweeper is disabled (set SWEEPERS_ENABLE_REINDEXER to run it)");
    }

    if failures.is_empty() {
        tracing::info!(
            "All sweepers completed in {}",
            human_readable_duration(begin.elapsed())
        );
        Ok(())
    } else {
        anyhow::bail!("sweepers failed: {}", failures.join(", "))
    }
}

async fn run_one<F>(name: &'static str, sweeper: F, failures: &mut Vec<&'static str>)
where
    F: Future<Output = anyhow::Result<()>>,
{
    let begin = Instant::now();
    tracing::info!("Running {name} sweeper");
    match sweeper.await {
        Ok(()) => tracing::info!(
            "{name} sweeper completed in {}",
            human_readable_duration(begin.elapsed())
        ),
        Err(e) => {
            tracing::error!(
                "{name} sweeper failed after {}: {e:#}",
                human_readable_duration(begin.elapsed())
            );
            failures.push(name);
        },
    }
}

/// `1h2m3s`-style rendering; hours and minutes are omitted when zero.
pub fn human_readable_duration(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    let hours = total_seconds / 3600;
    let minutes = total_seconds % 3600 / 60;
    let seconds = total_seconds % 60;
    let mut rendered = String::new();
    if hours > 0 {
        rendered.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        rendered.push_str(&format!("{minutes}m"));
    }
    rendered.push_str(&format!("{seconds}s"));
    rendered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::human_readable_duration;

    #[test]
    fn test_human_readable_duration() {
        assert_eq!(human_readable_duration(Duration::from_secs(0)), "0s");
        assert_eq!(human_readable_duration(Duration::from_secs(59)), "59s");
        assert_eq!(human_readable_duration(Duration::from_secs(61)), "1m1s");
        assert_eq!(human_readable_duration(Duration::from_secs(3600)), "1h0s");
        assert_eq!(human_readable_duration(Duration::from_secs(3723)), "1h2m3s");
    }
}
