mod commands;

use clap::{Parser, Subcommand};
use commands::launch::{LaunchArgs, Request};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;
use vessel_runtime::install_signal_handler;

#[derive(Debug, Parser)]
#[command(
    name = "vessel",
    version,
    about = "Run OCI images through an external OCI runtime"
)]
struct Cli {
    /// Settings file (default: /etc/vessel/vessel.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a command inside an image, ignoring its entrypoint.
    Exec {
        #[command(flatten)]
        launch: LaunchArgs,
        /// Image directory containing rootfs/ and config.json.
        image: PathBuf,
        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run the image's entrypoint; arguments replace its default command.
    Run {
        #[command(flatten)]
        launch: LaunchArgs,
        image: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Start an interactive shell inside an image.
    Shell {
        #[command(flatten)]
        launch: LaunchArgs,
        image: PathBuf,
    },
    /// Drive the container lifecycle directly.
    #[command(subcommand)]
    Oci(OciCommand),
}

#[derive(Debug, Subcommand)]
enum OciCommand {
    /// Create a container from a bundle containing config.json.
    Create {
        #[arg(short, long)]
        bundle: PathBuf,
        id: String,
    },
    /// Start a created container.
    Start { id: String },
    /// Send a signal to a container.
    Kill {
        id: String,
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },
    /// Print the container state as JSON.
    State { id: String },
    /// Delete a container and release its bundle.
    Delete { id: String },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe") || msg.contains("failed printing to stdout") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("VESSEL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let result = commands::load_settings(cli.config.as_deref()).and_then(|settings| {
        match cli.command {
            Commands::Exec {
                launch,
                image,
                command,
            } => commands::launch::run(settings, launch, Request::Exec { image, command }),
            Commands::Run {
                launch,
                image,
                args,
            } => commands::launch::run(settings, launch, Request::Run { image, args }),
            Commands::Shell { launch, image } => {
                commands::launch::run(settings, launch, Request::Shell { image })
            }
            Commands::Oci(cmd) => match cmd {
                OciCommand::Create { bundle, id } => {
                    commands::oci::create(&settings, &id, &bundle)
                }
                OciCommand::Start { id } => commands::oci::start(&settings, &id),
                OciCommand::Kill { id, signal } => commands::oci::kill(&settings, &id, &signal),
                OciCommand::State { id } => commands::oci::state(&settings, &id),
                OciCommand::Delete { id } => commands::oci::delete(&settings, &id),
            },
        }
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if commands::is_config_message(&msg) {
                EXIT_CONFIG_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
