use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use buildfarm::error::BackendError;
use buildfarm::lifecycle::{
    run_backend, run_job_grabber, run_vm_manager, run_worker, RunOptions,
};

#[derive(Parser, Debug)]
#[command(name = "buildfarm")]
#[command(version)]
#[command(about = "Build farm backend: worker pools, build VMs and job queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the backend daemon
    Backend(BackendArgs),

    /// Run one worker process (started by the backend daemon)
    Worker {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        group_id: u32,

        #[arg(long, default_value = "0")]
        worker_num: usize,
    },

    /// Run the VM manager
    Vmm {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the job grabber
    Jobgrab {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct BackendArgs {
    /// Path to the backend configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Detach from the terminal
    #[arg(short, long)]
    daemonize: bool,

    /// Write the daemon pid to this file
    #[arg(short, long)]
    pidfile: Option<PathBuf>,

    /// Drop privileges to this user
    #[arg(short = 'u', long)]
    daemon_user: Option<String>,

    /// Drop privileges to this group
    #[arg(short = 'g', long)]
    daemon_group: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Commands::Backend(backend) => run_backend(RunOptions {
            config_path: backend.config,
            daemonize: backend.daemonize,
            pidfile: backend.pidfile,
            daemon_user: backend.daemon_user,
            daemon_group: backend.daemon_group,
        }),
        Commands::Worker {
            config,
            group_id,
            worker_num,
        } => run_worker(&config, group_id, worker_num),
        Commands::Vmm { config } => run_vm_manager(&config),
        Commands::Jobgrab { config } => run_job_grabber(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(BackendError::Interrupted) => ExitCode::from(130),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
