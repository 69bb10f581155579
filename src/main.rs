use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{Method, StatusCode};
use clap::{Parser, Subcommand};
use console::style;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use oneshot::commands::{
    self, exec, redirect, CommandContext, Eol, ExecHandler, ExecOptions, ProxyHandler,
    ProxyOptions, ReceiveHandler, ReceiveOptions, RedirectHandler, SendHandler, SendOptions,
};
use oneshot::common::{
    apply_overrides, load_config, read_password_file, ConfigOverrides, GarbageFiles, OutputFormat,
};
use oneshot::events::{self, EventReceiver};
use oneshot::output;
use oneshot::report::{ReportOptions, Reporter};
use oneshot::server::{self, ArbiterConfig, Conclusion, Handler};
use oneshot::transfer::ArchiveMethod;
use oneshot::transport;

#[derive(Parser)]
#[command(name = "oneshot", version)]
#[command(about = "Serve or accept exactly one HTTP transfer, then exit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "ONESHOT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind (0 picks a free one)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Give up if nobody connects within this many seconds (0 waits forever)
    #[arg(short, long, global = true, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Stop after this many seconds no matter what
    #[arg(long, global = true, value_name = "SECONDS")]
    deadline: Option<u64>,

    /// Status output format
    #[arg(short, long, global = true, value_enum)]
    output: Option<OutputFormat>,

    /// Single-line JSON report
    #[arg(long, global = true)]
    compact: bool,

    #[arg(long, global = true)]
    no_color: bool,

    /// Require this basic-auth username
    #[arg(short = 'U', long, global = true)]
    username: Option<String>,

    /// Require this basic-auth password
    #[arg(short = 'W', long, global = true)]
    password: Option<String>,

    /// Read the basic-auth password from the first line of a file
    #[arg(long, global = true, value_name = "PATH", conflicts_with = "password")]
    password_file: Option<PathBuf>,

    /// Let link-preview bots through
    #[arg(long, global = true)]
    allow_bots: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a file, an archive of several paths, or stdin
    Send {
        /// Files or directories; none reads stdin
        paths: Vec<PathBuf>,

        /// Name presented to the client
        #[arg(short, long)]
        name: Option<String>,

        /// Extension used to pick the MIME type
        #[arg(short, long)]
        ext: Option<String>,

        #[arg(short, long)]
        mime: Option<String>,

        /// Archive format for directories and multiple paths
        #[arg(short, long, value_enum)]
        archive_method: Option<ArchiveMethod>,

        /// Let browsers display the payload instead of downloading it
        #[arg(short = 'D', long)]
        no_download: bool,

        #[arg(short, long, default_value_t = 200)]
        status_code: u16,

        /// Extra response header, NAME=VALUE (repeatable)
        #[arg(short = 'H', long)]
        header: Vec<String>,

        /// Stream stdin instead of reading it fully first
        #[arg(long)]
        stream: bool,
    },

    /// Accept one upload into a directory, or stdout
    Receive {
        /// Destination directory or file path; none writes to stdout
        dir: Option<PathBuf>,

        /// File name to save as, instead of the client's
        #[arg(short, long)]
        name: Option<String>,

        /// Require this token with the upload
        #[arg(long)]
        csrf_token: Option<String>,

        /// Line endings for text submitted through the form
        #[arg(long, value_enum, default_value_t = Eol::Unix)]
        eol: Eol,

        /// Decode a base64 upload before storing it
        #[arg(long)]
        decode_b64: bool,
    },

    /// Redirect the client to a URL
    Redirect {
        url: String,

        #[arg(short, long, default_value_t = redirect::DEFAULT_STATUS.as_u16())]
        status_code: u16,

        /// Extra response header, NAME=VALUE (repeatable)
        #[arg(short = 'H', long)]
        header: Vec<String>,
    },

    /// Run a program: request body to stdin, stdout to the client
    Exec {
        program: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Working directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Environment variable, NAME=VALUE (repeatable)
        #[arg(short, long)]
        env: Vec<String>,

        /// Extra response header, NAME=VALUE (repeatable)
        #[arg(short = 'H', long)]
        header: Vec<String>,

        /// Headers replace the default response headers
        #[arg(long)]
        replace_headers: bool,

        /// Content type of the program's output
        #[arg(short, long)]
        mime: Option<String>,

        /// Append the program's stderr to this file
        #[arg(long, value_name = "PATH")]
        stderr: Option<PathBuf>,
    },

    /// Forward the request to an upstream URL
    Proxy {
        url: String,

        /// Extra request header, NAME=VALUE (repeatable)
        #[arg(short = 'H', long)]
        header: Vec<String>,

        /// Method used upstream instead of the client's
        #[arg(short = 'X', long)]
        method: Option<String>,
    },
}

impl Cli {
    fn overrides(&self) -> Result<ConfigOverrides> {
        let archive_method = match &self.command {
            Commands::Send { archive_method, .. } => *archive_method,
            _ => None,
        };
        let password = match &self.password_file {
            Some(path) => Some(read_password_file(path)?),
            None => self.password.clone(),
        };
        Ok(ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            timeout: self.timeout,
            deadline: self.deadline,
            format: self.output,
            compact: self.compact.then_some(true),
            no_color: self.no_color.then_some(true),
            username: self.username.clone(),
            password,
            archive_method,
            allow_bots: self.allow_bots.then_some(true),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(conclusion) => ExitCode::from(conclusion.exit_code()),
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "oneshot=debug" } else { "oneshot=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Everything a command needs once its handler is built.
struct Launch {
    ctx: CommandContext,
    receiver: EventReceiver,
    payload_on_stdout: bool,
}

async fn run(cli: Cli) -> Result<Conclusion> {
    let config = apply_overrides(load_config(cli.config.as_deref())?, &cli.overrides()?);
    config.validate()?;

    let (events, receiver) = events::channel(events::DEFAULT_CAPACITY);
    let ctx = CommandContext {
        config: Arc::new(config),
        events,
        cancel: CancellationToken::new(),
        garbage: GarbageFiles::new(),
    };
    let payload_on_stdout = matches!(cli.command, Commands::Receive { dir: None, .. });
    let launch = Launch {
        ctx: ctx.clone(),
        receiver,
        payload_on_stdout,
    };

    match cli.command {
        Commands::Send {
            paths,
            name,
            ext,
            mime,
            archive_method: _,
            no_download,
            status_code,
            header,
            stream,
        } => {
            let reader = SendHandler::for_paths(&ctx, paths)
                .with_name(name)
                .with_extension(ext)
                .with_mime_type(mime)
                .streaming_stdin(stream);
            let options = SendOptions {
                status: status(status_code)?,
                headers: commands::parse_headers(&header)?,
                no_download,
            };
            let handler = SendHandler::prepare(reader, options).await?;
            serve(handler, launch).await
        }
        Commands::Receive {
            dir,
            name,
            csrf_token,
            eol,
            decode_b64,
        } => {
            let writer = ReceiveHandler::destination(&ctx, dir, name)?;
            let handler = ReceiveHandler::new(
                writer,
                ReceiveOptions {
                    csrf_token,
                    eol,
                    decode_b64,
                },
            );
            serve(handler, launch).await
        }
        Commands::Redirect {
            url,
            status_code,
            header,
        } => {
            let handler =
                RedirectHandler::new(&url, status(status_code)?, commands::parse_headers(&header)?)?;
            serve(handler, launch).await
        }
        Commands::Exec {
            program,
            args,
            dir,
            env,
            header,
            replace_headers,
            mime,
            stderr,
        } => {
            let handler = ExecHandler::new(ExecOptions {
                program,
                args,
                dir,
                env: exec::parse_env(&env)?,
                headers: commands::parse_headers(&header)?,
                replace_headers,
                mime,
                stderr,
            })?;
            serve(handler, launch).await
        }
        Commands::Proxy {
            url,
            header,
            method,
        } => {
            let upstream = Url::parse(&url).with_context(|| format!("Invalid upstream URL '{url}'"))?;
            let method = method
                .map(|m| Method::from_bytes(m.to_uppercase().as_bytes()))
                .transpose()
                .context("Invalid HTTP method")?;
            let handler = ProxyHandler::new(ProxyOptions {
                upstream,
                method,
                headers: commands::parse_headers(&header)?,
            })?;
            serve(handler, launch).await
        }
    }
}

fn status(code: u16) -> Result<StatusCode> {
    StatusCode::from_u16(code).with_context(|| format!("Invalid status code {code}"))
}

/// Binds, reports, and runs `handler` until the run concludes.
async fn serve<H: Handler>(handler: H, launch: Launch) -> Result<Conclusion> {
    let Launch {
        ctx,
        receiver,
        payload_on_stdout,
    } = launch;
    let config = ctx.config.clone();
    let human = config.output.format == OutputFormat::Human;

    let spinner = human.then(|| output::spinner("starting server"));
    let listener = match transport::bind(config.bind_addr()?).await {
        Ok(listener) => listener,
        Err(e) => {
            if let Some(spinner) = &spinner {
                output::finish_spinner_error(spinner, "could not start server");
            }
            return Err(e);
        }
    };
    let local = listener.local_addr().context("Failed to read bound address")?;
    tracing::info!(%local, "server bound");
    if let Some(spinner) = &spinner {
        let urls = transport::display_urls(local);
        output::finish_spinner_success(spinner, &output::listening_message(&urls));
    }

    let reporter = Reporter::stdio(
        receiver,
        ReportOptions {
            format: config.output.format,
            compact: config.output.compact,
            include_content: config.output.include_body || payload_on_stdout,
            payload_on_stdout,
            color: !config.output.no_color,
        },
    );

    let summary = server::run(
        handler,
        listener,
        ArbiterConfig::from(config.as_ref()),
        config.deadline(),
        ctx.events.clone(),
        ctx.cancel.clone(),
    )
    .await;

    let report = reporter.finish(summary.conclusion).await?;
    tracing::debug!(
        success = report.success.is_some(),
        attempts = report.attempts.len(),
        "report written"
    );

    let swept = ctx.garbage.sweep();
    if swept > 0 {
        tracing::info!(swept, "removed leftover partial files");
    }
    Ok(summary.conclusion)
}
