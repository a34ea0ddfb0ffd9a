use std::io::{self, Write};

use serde::Serialize;

use crate::app::{EntityResult, ProgressEvent, ProgressSink, ReindexResult, SearchResult, StatsResult};
use crate::import::ImportReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_entity(result: &EntityResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stats(result: &StatsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_import(result: &ImportReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_reindex(result: &ReindexResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable output; progress goes to stderr.
pub struct TextOutput;

impl TextOutput {
    pub fn print_entity(result: &EntityResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        let summary = &result.summary;
        writeln!(
            stdout,
            "{} ({})  {}",
            summary.id,
            summary.kind,
            summary.label.as_deref().unwrap_or("-")
        )?;
        if let Some(description) = &summary.description {
            writeln!(stdout, "  {description}")?;
        }
        let entity = &result.entity;
        writeln!(
            stdout,
            "  labels: {}  aliases: {}  statements: {}",
            entity.labels.len(),
            entity.aliases.values().map(|set| set.len()).sum::<usize>(),
            entity.claims.statements.len()
        )?;
        writeln!(stdout, "  source: {}  fetched: {}", entity.source, entity.fetched_at.to_rfc3339())?;
        Ok(())
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        if result.hits.is_empty() {
            writeln!(stdout, "no matches for {:?}", result.query)?;
            return Ok(());
        }
        for hit in &result.hits {
            writeln!(
                stdout,
                "{:>10}  {:>8.3}  {}  {}",
                hit.entity.id.as_str(),
                hit.score,
                hit.entity.label.as_deref().unwrap_or("-"),
                hit.entity.description.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }

    pub fn print_stats(result: &StatsResult) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "database:   {}", result.database)?;
        writeln!(stdout, "entities:   {}", result.total)?;
        writeln!(stdout, "items:      {}", result.items)?;
        writeln!(stdout, "properties: {}", result.properties)?;
        match &result.checkpoint {
            Some(checkpoint) => writeln!(
                stdout,
                "import:     {} at offset {} ({} committed)",
                if checkpoint.completed { "completed" } else { "in progress" },
                checkpoint.byte_offset,
                checkpoint.entities_committed
            )?,
            None => writeln!(stdout, "import:     not started")?,
        }
        Ok(())
    }

    pub fn print_import(result: &ImportReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        if result.already_completed {
            writeln!(stdout, "import already completed ({} entities)", result.total_committed)?;
            return Ok(());
        }
        let state = if result.completed {
            "completed"
        } else if result.cancelled {
            "cancelled"
        } else {
            "paused"
        };
        writeln!(
            stdout,
            "import {state}: {} entities this run, {} total, offset {}",
            result.entities_committed, result.total_committed, result.byte_offset
        )?;
        if result.decode_failures > 0 {
            writeln!(stdout, "{} records failed to decode", result.decode_failures)?;
        }
        Ok(())
    }

    pub fn print_reindex(result: &ReindexResult) -> io::Result<()> {
        writeln!(
            io::stdout().lock(),
            "reindexed {} entities in {:.1}s",
            result.indexed,
            result.elapsed_secs
        )
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
