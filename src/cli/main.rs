//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! The thin command-line surface over the gateway core.

use std::path::PathBuf;

use rand::{rngs::OsRng, Rng};
use structopt::StructOpt;

use crate::graph::{client::GraphClient, token_store::TokenStore};
use crate::support::{error::Error, system_config::GatewayConfig};

/// Normal shutdown.
pub const EXIT_OK: i32 = 0;
/// Fatal configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Interactive authentication is required.
pub const EXIT_AUTH_REQUIRED: i32 = 2;
/// Unrecoverable Graph error during startup.
pub const EXIT_GRAPH: i32 = 3;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the gateway: bind the configured listeners and proxy SMTP/POP3
    /// sessions to Microsoft Graph.
    Serve(CommonOptions),
    /// Perform the interactive device-code login and store the encrypted
    /// tokens.
    Login(CommonOptions),
    /// Validate the configuration and print the effective settings.
    CheckConfig(CommonOptions),
    /// Hash a password for use in the mailbox allowlist.
    Hash(HashSubcommand),
}

#[derive(StructOpt, Default)]
struct CommonOptions {
    /// Path to the configuration file
    /// [default: $M365_PROXY_CONFIG_FILE or ./config.json]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,
}

#[derive(StructOpt)]
struct HashSubcommand {
    /// The password to hash.
    password: String,
}

pub fn main() {
    let command = Command::from_args();
    let code = match command {
        Command::Serve(options) => serve_command(options),
        Command::Login(options) => login_command(options),
        Command::CheckConfig(options) => check_config_command(options),
        Command::Hash(subcommand) => hash_command(&subcommand.password),
    };
    std::process::exit(code);
}

fn config_path(options: &CommonOptions) -> PathBuf {
    options
        .config
        .clone()
        .or_else(|| {
            std::env::var_os("M365_PROXY_CONFIG_FILE").map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

fn load_config(options: &CommonOptions) -> Result<GatewayConfig, i32> {
    GatewayConfig::load(&config_path(options)).map_err(|e| {
        eprintln!("graphgate: {e}");
        EXIT_CONFIG
    })
}

fn serve_command(options: CommonOptions) -> i32 {
    let config = match load_config(&options) {
        Ok(config) => config,
        Err(code) => return code,
    };
    init_logging(&config);
    super::serve::serve(config)
}

fn login_command(options: CommonOptions) -> i32 {
    let config = match load_config(&options) {
        Ok(config) => config,
        Err(code) => return code,
    };
    init_logging(&config);

    let graph = match open_graph(&config) {
        Ok(graph) => graph,
        Err(code) => return code,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    let result = runtime.block_on(
        graph
            .authenticator()
            .device_login(&|prompt| println!("{}", prompt.message)),
    );

    match result {
        Ok(()) => {
            println!("Login successful; tokens stored.");
            EXIT_OK
        },
        Err(
            e @ (Error::DeviceCodeFailed(..) | Error::DeviceCodeTimedOut),
        ) => {
            eprintln!("graphgate: login failed: {e}");
            EXIT_AUTH_REQUIRED
        },
        Err(e) => {
            eprintln!("graphgate: login failed: {e}");
            EXIT_GRAPH
        },
    }
}

fn check_config_command(options: CommonOptions) -> i32 {
    let config = match load_config(&options) {
        Ok(config) => config,
        Err(code) => return code,
    };

    println!("Configuration at {} is valid.", config_path(&options).display());
    println!("  upstream user:   {}", config.user);
    println!("  tenant:          {}", config.tenant_id);
    println!("  bind address:    {}", config.bind);
    for (name, port) in [
        ("smtp", config.smtp_port),
        ("smtps", config.smtps_port),
        ("pop3", config.pop3_port),
        ("pop3s", config.pop3s_port),
    ] {
        if let Some(port) = port {
            println!("  {name} listener:   {port}");
        }
    }
    println!(
        "  TLS material:    {}",
        if config.tls.is_some() {
            "configured"
        } else {
            "not configured"
        },
    );
    println!("  attachment cap:  {} MiB", config.attachment_limit_mb);
    println!("  queue directory: {}", config.queue_dir().display());
    println!("  token store:     {}", config.token_path().display());
    for mailbox in &config.mailboxes {
        println!(
            "  mailbox {} (folder {}, mark_read {}, delete_after_fetch {})",
            mailbox.username,
            mailbox.folder,
            mailbox.mark_read,
            mailbox.delete_after_fetch,
        );
    }
    EXIT_OK
}

fn hash_command(password: &str) -> i32 {
    let salt: [u8; 16] = OsRng.gen();
    match argon2::hash_encoded(
        password.as_bytes(),
        &salt,
        &argon2::Config::default(),
    ) {
        Ok(hash) => {
            println!("{hash}");
            EXIT_OK
        },
        Err(e) => {
            eprintln!("graphgate: hashing failed: {e}");
            EXIT_CONFIG
        },
    }
}

pub(super) fn open_graph(config: &GatewayConfig) -> Result<GraphClient, i32> {
    let store = TokenStore::new(
        config.token_path().to_owned(),
        &config.user,
    )
    .map_err(|e| {
        eprintln!("graphgate: cannot open token store: {e}");
        EXIT_CONFIG
    })?;
    GraphClient::new(config, store).map_err(|e| {
        eprintln!("graphgate: cannot set up the Graph client: {e}");
        EXIT_CONFIG
    })
}

/// Configure log4rs with a stderr appender and, when the configuration
/// names a log file, a file appender as well.
fn init_logging(config: &GatewayConfig) {
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let level = match config
        .log
        .level
        .as_deref()
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        Some("DEBUG") => log::LevelFilter::Debug,
        Some("WARNING") | Some("WARN") => log::LevelFilter::Warn,
        Some("ERROR") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {m}{n}";
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let mut builder = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(ref path) = config.log.file {
        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(path)
        {
            Ok(file) => {
                builder = builder
                    .appender(Appender::builder().build("file", Box::new(file)));
                root = root.appender("file");
            },
            Err(e) => {
                eprintln!(
                    "graphgate: log file {} is not writable ({e}); \
                     logging to stderr only",
                    path.display(),
                );
            },
        }
    }

    let log_config = builder
        .build(root.build(level))
        .expect("invalid logging configuration");
    let _ = log4rs::init_config(log_config);
}
