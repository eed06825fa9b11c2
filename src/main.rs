use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};

mod client;
mod config;
mod daemon;
mod db;
mod paths;

#[derive(Parser)]
#[command(name = "grab", about = "Queue and manage media downloads", version)]
struct Cli {
    #[arg(long, global = true, env = "GRAB_DEBUG")]
    debug: bool,

    #[arg(long, global = true, env = "GRAB_HOME")]
    grab_home: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a download
    #[command(alias = "dl")]
    Download {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Format selector passed to the extractor
        #[arg(short, long)]
        format: Option<String>,

        /// Extra extractor parameters as key=value pairs
        #[arg(long = "param")]
        params: Vec<String>,

        /// Skip extractor detection and treat URLs as generic pages
        #[arg(long)]
        force_generic_extractor: bool,
    },

    /// Manage queued and finished jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Show queue and job-status counters
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::aot::Shell,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Plain,
    Json,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List jobs, newest first
    #[command(alias = "ls")]
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,

        /// Include job logs in the output
        #[arg(long)]
        logs: bool,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Show one job, including its log
    Show {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: i64,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },

    /// Stop a pending or running job
    Stop {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: i64,
    },

    /// Queue a fresh copy of a job and drop the old record
    Retry {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: i64,
    },

    /// Remove a job record
    #[command(alias = "rm")]
    Remove {
        /// Job ID
        #[arg(add = ArgValueCompleter::new(complete_job_ids))]
        id: i64,
    },

    /// Prune finished jobs down to the retention bound
    Clean,

    /// Remove all finished jobs
    Purge,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Open the config file in $EDITOR
    Edit,
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Remove existing runtime files before starting
        #[arg(long)]
        force: bool,
    },

    /// Install the daemon as a launchd LaunchAgent
    Install,

    /// Uninstall the daemon LaunchAgent
    Uninstall,
}

#[tokio::main]
async fn main() {
    clap_complete::env::CompleteEnv::with_factory(Cli::command).complete();

    if let Err(e) = run().await {
        eprintln!("\x1b[1;31merror:\x1b[0m {e}");

        // Print the chain of causes, if any.
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  \x1b[1;31mcaused by:\x1b[0m {cause}");
            source = std::error::Error::source(cause);
        }

        std::process::exit(1);
    }
}

fn complete_job_ids(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let current = current.to_str().unwrap_or_default().to_owned();

    let result = std::thread::spawn(move || -> anyhow::Result<Vec<CompletionCandidate>> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            paths::init(None);
            let client = client::DaemonClient::new()?;
            let jobs = client.list_jobs(None, false).await?;

            let candidates = jobs
                .iter()
                .filter(|j| j.id.to_string().starts_with(&current))
                .map(|j| {
                    let help = format!("{} ({})", j.name, j.status);
                    CompletionCandidate::new(j.id.to_string()).help(Some(help.into()))
                })
                .collect();

            Ok(candidates)
        })
    })
    .join();

    result.ok().and_then(|r| r.ok()).unwrap_or_default()
}

fn print_job(job: &db::Job, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Human => {
            println!(
                "\x1b[1;32m{}\x1b[0m \x1b[2m(id: {})\x1b[0m",
                job.status, job.id
            );
            println!("  \x1b[1mname:\x1b[0m     {}", job.name);
            println!("  \x1b[1mformat:\x1b[0m   {}", job.format);
            println!("  \x1b[1murls:\x1b[0m     {}", job.urls.join(" "));
            println!("  \x1b[1mcreated:\x1b[0m  {}", job.created_at);
            if job.pid != 0 {
                println!("  \x1b[1mpid:\x1b[0m      {}", job.pid);
            }
            if !job.log.is_empty() {
                println!("  \x1b[1mlog:\x1b[0m");
                for line in job.log.lines() {
                    println!("    {line}");
                }
            }
        }
        OutputFormat::Plain => {
            println!("{}\t{}\t{}", job.id, job.status, job.name);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(job)?);
        }
    }
    Ok(())
}

fn print_job_list(jobs: &[db::Job], format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Human => {
            if jobs.is_empty() {
                return Ok(());
            }
            println!("{:<6}  {:<10}  NAME", "ID", "STATUS");
            for j in jobs {
                println!("{:<6}  {:<10}  {}", j.id, j.status, j.name);
            }
        }
        OutputFormat::Plain => {
            for j in jobs {
                println!("{}\t{}\t{}", j.id, j.status, j.name);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&jobs)?);
        }
    }
    Ok(())
}

/// Split `key=value` CLI pairs into the extractor parameter object.
fn parse_params(params: &[String]) -> anyhow::Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for param in params {
        match param.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_owned(), serde_json::Value::String(value.to_owned()));
            }
            None => {
                map.insert(param.clone(), serde_json::Value::Bool(true));
            }
        }
    }
    Ok(serde_json::Value::Object(map))
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let is_daemon = matches!(cli.command, Some(Command::Daemon { .. }));

    paths::init(cli.grab_home);
    paths::ensure_dirs()?;

    let config = config::load()?;

    let config_debug = config.daemon.as_ref().is_some_and(|d| d.debug);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.debug || config_debug {
            tracing::Level::DEBUG
        } else if is_daemon {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        })
        .init();

    match cli.command {
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { force } => daemon::start(force).await?,
            DaemonCommand::Install => daemon::install()?,
            DaemonCommand::Uninstall => daemon::uninstall()?,
        },
        Some(Command::Config { command }) => match command {
            ConfigCommand::Edit => {
                let editor =
                    std::env::var("EDITOR").map_err(|_| anyhow::anyhow!("$EDITOR is not set"))?;
                let path = paths::config_dir()?.join("config.toml");
                std::fs::create_dir_all(path.parent().unwrap())?;
                let status = std::process::Command::new(&editor).arg(&path).status()?;
                if !status.success() {
                    anyhow::bail!("{editor} exited with {status}");
                }
            }
        },
        Some(Command::Version) => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        Some(Command::Completions { shell }) => {
            let status = std::process::Command::new(std::env::current_exe()?)
                .env("COMPLETE", shell.to_string())
                .status()?;
            std::process::exit(status.code().unwrap_or(1));
        }
        Some(cmd) => {
            let client = client::DaemonClient::new()?;
            match cmd {
                Command::Download {
                    urls,
                    format,
                    params,
                    force_generic_extractor,
                } => {
                    let extra_params = parse_params(&params)?;
                    let accepted = client
                        .queue_download(
                            &urls,
                            format.as_deref(),
                            &extra_params,
                            force_generic_extractor,
                        )
                        .await?;
                    for url in &accepted {
                        println!("queued {url}");
                    }
                }
                Command::Jobs { command } => match command {
                    JobsCommand::List {
                        status,
                        logs,
                        format,
                    } => {
                        let jobs = client.list_jobs(status.as_deref(), logs).await?;
                        print_job_list(&jobs, &format)?;
                    }
                    JobsCommand::Show { id, format } => {
                        let job = client.get_job(id).await?;
                        print_job(&job, &format)?;
                    }
                    JobsCommand::Stop { id } => {
                        if client.stop_job(id).await? {
                            println!("stop requested for job {id}");
                        } else {
                            anyhow::bail!("job {id} is not stoppable in its current state");
                        }
                    }
                    JobsCommand::Retry { id } => {
                        client.retry_job(id).await?;
                        println!("retry queued for job {id}");
                    }
                    JobsCommand::Remove { id } => {
                        client.delete_job(id).await?;
                        println!("removal queued for job {id}");
                    }
                    JobsCommand::Clean => {
                        client.clean_jobs().await?;
                        println!("clean queued");
                    }
                    JobsCommand::Purge => {
                        client.purge_jobs().await?;
                        println!("purge queued");
                    }
                },
                Command::Stats => {
                    let stats = client.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats["stats"])?);
                }
                Command::Config { .. }
                | Command::Daemon { .. }
                | Command::Completions { .. }
                | Command::Version => {
                    unreachable!()
                }
            }
        }
        None => {}
    }

    Ok(())
}
