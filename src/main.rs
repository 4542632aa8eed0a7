use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use mediadedup::dedup_core::{
    Cli, Commands, DetectOptions, FileIndex, Orchestrator, OutputFormat, PipelineEvent,
    enumerate::{ExclusionRule, ExclusionRules, TRASH_DIR_NAME},
    groups::{DuplicateGroup, GroupState},
    keeper::{FieldSource, MergePlan},
};
use simplelog::{CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, WriteLogger};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize loggers
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Warn,
        Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(log_path) = &cli.log {
        loggers.push(WriteLogger::new(
            cli.log_level,
            Config::default(),
            File::create(log_path)?,
        ));
    }
    CombinedLogger::init(loggers)?;

    match cli.command {
        Commands::Scan {
            roots,
            index,
            config,
            incremental,
            follow_symlinks,
            phash,
            exclude,
            exclude_contains,
        } => run_scan(
            roots,
            index,
            config,
            incremental,
            follow_symlinks,
            phash,
            exclude,
            exclude_contains,
        ),
        Commands::Groups { index, output } => run_groups(index, output),
        Commands::Merge {
            index,
            config,
            group,
            all,
            dry_run,
            yes,
        } => run_merge(index, config, group, all, dry_run, yes),
        Commands::Undo { index } => run_undo(index),
        Commands::Stats { index } => run_stats(index),
        Commands::Cleanup { index } => run_cleanup(index),
    }
}

fn load_options(config: Option<&Path>) -> Result<DetectOptions> {
    Ok(match config {
        Some(path) => DetectOptions::load(path)?,
        None => DetectOptions::default(),
    })
}

fn trash_base_for(index_path: &Path) -> PathBuf {
    index_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .join(TRASH_DIR_NAME)
}

#[allow(clippy::too_many_arguments)]
fn run_scan(
    roots: Vec<PathBuf>,
    index_path: PathBuf,
    config: Option<PathBuf>,
    incremental: bool,
    follow_symlinks: bool,
    phash: bool,
    exclude: Vec<String>,
    exclude_contains: Vec<String>,
) -> Result<()> {
    let mut options = load_options(config.as_deref())?;
    options.policies.incremental |= incremental;
    options.policies.follow_symlinks |= follow_symlinks;
    options.policies.enable_phash |= phash;

    let mut rules = ExclusionRules::default();
    for pattern in &exclude {
        rules = rules.with_rule(ExclusionRule::glob(pattern)?);
    }
    for needle in exclude_contains {
        rules = rules.with_rule(ExclusionRule::PathContains(needle));
    }

    let (event_tx, event_rx) = unbounded();
    let printer = std::thread::spawn(move || {
        let spinner = ProgressBar::new_spinner().with_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(120));
        for event in event_rx {
            match event {
                PipelineEvent::Started { root } => {
                    spinner.set_message(format!("Scanning {}", root.display()));
                }
                PipelineEvent::Progress { scanned } => {
                    spinner.set_message(format!("Scanned {scanned} files"));
                }
                PipelineEvent::Error { path, reason } => {
                    spinner.println(format!("error: {}: {}", path.display(), reason));
                }
                PipelineEvent::GroupFormed {
                    group_id,
                    members,
                    confidence,
                    ..
                } => {
                    spinner.println(format!(
                        "group {group_id}: {members} files (confidence {confidence:.2})"
                    ));
                }
                _ => {}
            }
        }
        spinner.finish_and_clear();
    });

    let index = FileIndex::open(&index_path)?;
    let trash_base = trash_base_for(&index_path);
    let mut orchestrator = Orchestrator::new(index, options, event_tx, trash_base);
    let result = orchestrator.run_detection(&roots, rules);
    drop(orchestrator);
    let _ = printer.join();

    let (metrics, groups) = result?;
    println!(
        "Scan complete: {} files ({} photos, {} videos, {} audio), {} skipped, {} errors.",
        metrics.enumerated,
        metrics.photos,
        metrics.videos,
        metrics.audio,
        metrics.skipped,
        metrics.errors
    );
    if groups.is_empty() {
        println!("No duplicate groups found.");
    } else {
        println!(
            "{} duplicate groups found. Review with `mediadedup groups`, merge with `mediadedup merge`.",
            groups.len()
        );
    }
    Ok(())
}

fn run_groups(index_path: PathBuf, output: OutputFormat) -> Result<()> {
    let index = FileIndex::open(&index_path)?;
    let groups = index.fetch_groups(None)?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
        OutputFormat::Table => {
            if groups.is_empty() {
                println!("No duplicate groups. Run `mediadedup scan` first.");
                return Ok(());
            }
            for group in &groups {
                println!(
                    "group {} [{}] {} members, confidence {:.2}{}",
                    group.id,
                    group.state.as_str(),
                    group.members.len(),
                    group.confidence,
                    if group.incomplete { ", incomplete" } else { "" },
                );
                for member in &group.members {
                    let path = index
                        .resolve_path(member.file_id)?
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| format!("<unindexed {}>", member.file_id));
                    println!(
                        "  {} {}",
                        if member.keeper_suggestion { "*" } else { " " },
                        path
                    );
                }
                for line in &group.rationale {
                    println!("    - {line}");
                }
            }
        }
    }
    Ok(())
}

fn run_merge(
    index_path: PathBuf,
    config: Option<PathBuf>,
    group_id: Option<i64>,
    all: bool,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    if group_id.is_none() && !all {
        anyhow::bail!("pass --group <id> or --all");
    }

    let options = load_options(config.as_deref())?;
    let index = FileIndex::open(&index_path)?;
    let trash_base = trash_base_for(&index_path);
    let (event_tx, _event_rx) = unbounded();
    let mut orchestrator = Orchestrator::new(index, options, event_tx, trash_base);

    let mut mergeable = orchestrator
        .index()
        .fetch_groups(Some(GroupState::Complete))?;
    mergeable.extend(
        orchestrator
            .index()
            .fetch_groups(Some(GroupState::Planned))?,
    );
    mergeable.sort_by_key(|g| g.id);
    let selected: Vec<DuplicateGroup> = match group_id {
        Some(id) => mergeable.into_iter().filter(|g| g.id == id).collect(),
        None => mergeable,
    };
    if selected.is_empty() {
        println!("Nothing to merge. Run `mediadedup scan` and check `mediadedup groups`.");
        return Ok(());
    }

    let mut merged = 0;
    for group in &selected {
        if group.incomplete && group_id.is_none() {
            println!(
                "Skipping incomplete group {} (missing signatures).",
                group.id
            );
            continue;
        }

        let plan = orchestrator.plan_group(group)?;
        print_plan(&orchestrator, &plan)?;

        if dry_run {
            let result = orchestrator.execute_plan(&plan, true, false)?;
            println!(
                "[DRY RUN] group {}: would merge {} fields and trash {} files.",
                plan.group_id,
                result.merged_fields.len(),
                result.trashed.len()
            );
            continue;
        }

        let confirmed = yes
            || confirm(&format!(
                "Merge group {} (trash {} files)? [y/N]: ",
                plan.group_id,
                plan.trash_list.len()
            ))?;
        if !confirmed {
            println!("Skipped group {}.", plan.group_id);
            continue;
        }

        let result = orchestrator.execute_plan(&plan, false, true)?;
        merged += 1;
        println!(
            "Merged group {} (transaction {}). Kept {}, trashed {} files.",
            plan.group_id,
            result.transaction_id.unwrap_or_default(),
            plan.keeper_path.display(),
            result.trashed.len()
        );
    }

    if !dry_run {
        println!("{merged} groups merged. Undo the latest with `mediadedup undo`.");
    }
    Ok(())
}

fn print_plan(orchestrator: &Orchestrator, plan: &MergePlan) -> Result<()> {
    println!("group {}:", plan.group_id);
    println!("  keeper: {}", plan.keeper_path.display());
    for loser in &plan.trash_list {
        let path = orchestrator
            .index()
            .resolve_path(*loser)?
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("<unindexed {loser}>"));
        println!("  trash:  {path}");
    }
    for change in &plan.field_changes {
        match &change.source {
            FieldSource::Keep => {}
            FieldSource::Fill => println!(
                "  fill {}: {}",
                change.field,
                change.new.as_deref().unwrap_or("-")
            ),
            FieldSource::MergeFrom { file_id } => println!(
                "  merge {}: {} (from {})",
                change.field,
                change.new.as_deref().unwrap_or("-"),
                file_id
            ),
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn run_undo(index_path: PathBuf) -> Result<()> {
    let index = FileIndex::open(&index_path)?;
    let trash_base = trash_base_for(&index_path);
    let (event_tx, _event_rx) = unbounded();
    let mut orchestrator = Orchestrator::new(index, DetectOptions::default(), event_tx, trash_base);

    match orchestrator.undo_last()? {
        Some(undo) => {
            println!(
                "Undid transaction {} for group {}. Keeper metadata restored.",
                undo.transaction_id, undo.group_id
            );
            if undo.partial {
                println!("Losers were permanently deleted and cannot be recovered.");
            } else {
                for path in &undo.losers_in_trash {
                    println!("  in trash: {}", path.display());
                }
            }
        }
        None => println!("No committed merge to undo."),
    }
    Ok(())
}

fn run_stats(index_path: PathBuf) -> Result<()> {
    let index = FileIndex::open(&index_path)?;
    let stats = index.stats()?;
    println!("Photos:            {}", stats.photos);
    println!("Videos:            {}", stats.videos);
    println!("Audio:             {}", stats.audio);
    println!("Image signatures:  {}", stats.image_signatures);
    println!("Video signatures:  {}", stats.video_signatures);
    println!("Duplicate groups:  {}", stats.groups);
    println!("Committed merges:  {}", stats.committed_transactions);
    Ok(())
}

fn run_cleanup(index_path: PathBuf) -> Result<()> {
    let index = FileIndex::open(&index_path)?;
    let trash_base = trash_base_for(&index_path);
    let (event_tx, _event_rx) = unbounded();
    let mut orchestrator = Orchestrator::new(index, DetectOptions::default(), event_tx, trash_base);
    let cleaned = orchestrator.cleanup()?;
    println!("Removed {cleaned} expired transactions and their trash staging.");
    Ok(())
}
