use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use dialogsim::{
    cache::seed_from_transcript,
    domains::booking,
    providers::openai::OpenAI,
    read_results, write_results, Actor, InMemoryCache, LLMProvider, LlmActor,
    OrchestratorConfig, SamplingParams, Task, ToolTurnPolicy, TrialRunner,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "run-trials")]
#[command(about = "Run benchmark conversation trials and score the transcripts")]
struct Args {
    /// Path to a task file or directory of task files (YAML/JSON)
    #[arg(long, default_value = "tasks")]
    tasks: PathBuf,

    /// Trials per task
    #[arg(long, default_value_t = 1)]
    trials: usize,

    /// Concurrent trials
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Agent model identifier
    #[arg(long)]
    model: String,

    /// User simulator model (defaults to the agent model)
    #[arg(long)]
    user_model: Option<String>,

    /// Output path for JSONL results
    #[arg(long)]
    out: Option<PathBuf>,

    /// Run only tasks whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Seed the response cache from a previous JSONL run before executing
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Hand the turn over after a tool result instead of re-prompting
    #[arg(long)]
    yield_on_tool_result: bool,

    /// Wall-clock budget per trial, in seconds
    #[arg(long)]
    trial_timeout_secs: Option<u64>,
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("runs/{ts}.jsonl"))
}

fn filter_tasks(mut tasks: Vec<Task>, filters: &[String]) -> Vec<Task> {
    if filters.is_empty() {
        return tasks;
    }
    tasks.retain(|t| filters.iter().any(|f| t.id.contains(f)));
    tasks
}

async fn seed_cache(
    cache: &InMemoryCache,
    path: &Path,
    agent_sampling: &SamplingParams,
    user_sampling: &SamplingParams,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut seeded = 0;
    for result in read_results(path)? {
        seeded += seed_from_transcript(
            cache,
            ("agent", agent_sampling),
            ("user", user_sampling),
            result.conversation.messages(),
        )
        .await?;
    }
    eprintln!("Seeded {seeded} cache entries from {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let tasks = dialogsim::load_tasks(&args.tasks)?;
    let tasks = filter_tasks(tasks, &args.filter);
    if tasks.is_empty() {
        eprintln!("No tasks matched.");
        std::process::exit(2);
    }

    let domain = booking::domain()?;
    let registry = Arc::new(domain.registry);
    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);

    let agent_sampling = SamplingParams::new(args.model.clone());
    let user_sampling =
        SamplingParams::new(args.user_model.clone().unwrap_or_else(|| args.model.clone()));

    let cache = Arc::new(InMemoryCache::new());
    if let Some(replay) = &args.replay {
        seed_cache(&cache, replay, &agent_sampling, &user_sampling).await?;
    }

    let config = OrchestratorConfig {
        tool_turn_policy: if args.yield_on_tool_result {
            ToolTurnPolicy::YieldTurn
        } else {
            ToolTurnPolicy::RepromptActor
        },
        trial_timeout: args.trial_timeout_secs.map(Duration::from_secs),
        warn_on_cache_miss: args.replay.is_some(),
        ..Default::default()
    };

    let agent: Arc<dyn Actor> = Arc::new(LlmActor::agent(
        Arc::clone(&provider),
        agent_sampling.clone(),
        &domain.name,
        &domain.policy,
    )?);

    let out_path = args.out.unwrap_or_else(default_out_path);
    let mut all_results = Vec::new();
    let mut total = 0usize;
    let mut passed = 0usize;
    let mut reward_sum = 0.0f64;

    for task in &tasks {
        let user: Arc<dyn Actor> = Arc::new(LlmActor::user(
            Arc::clone(&provider),
            user_sampling.clone(),
            &domain.name,
            &task.persona,
            &task.scenario,
        )?);

        let mut runner = TrialRunner::new(Arc::clone(&agent), user, Arc::clone(&registry))
            .with_config(config.clone());
        if !args.no_cache {
            runner = runner.with_cache(cache.clone());
        }

        let results = runner.run_trials(task, args.trials, args.concurrency).await;
        for result in &results {
            total += 1;
            let reward = result.reward.as_ref().map(|r| r.reward).unwrap_or(0.0);
            reward_sum += reward;
            if reward >= 0.999 {
                passed += 1;
            } else {
                eprintln!(
                    "FAIL {} trial (reward {reward:.3}, {:?})",
                    task.id, result.termination
                );
                if let Some(info) = &result.reward {
                    for failure in &info.failures {
                        eprintln!("  - {failure}");
                    }
                }
            }
        }
        all_results.extend(results);
    }

    write_results(&out_path, &all_results)?;

    let denom = total.max(1) as f64;
    println!(
        "Tasks: {}, Trials: {total}, Passed: {passed}, AvgReward: {:.3}, Output: {}",
        tasks.len(),
        reward_sum / denom,
        out_path.display()
    );

    if passed == total {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
