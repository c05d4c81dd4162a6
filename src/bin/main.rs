//! Beezap CLI - wallet session and zaps from the terminal
//!
//! Every command prints one JSON object:
//!   beezap status                          → {"lifecycle": "locked_with_backup", ...}
//!   beezap init --password <pw>            → {"mnemonic": "...", "balance": 0}
//!   beezap unlock --password <pw>          → {"balance": 100000}
//!   beezap send <address> <amount>         → {"state": "settled", "fee": 5, ...}
//!
//! The backend is the in-process sandbox, so balances live only as long as the
//! process. Sealed seed and session snapshot persist under the data dir.
//!
//! Output format:
//!   --json     Output raw JSON (default for non-tty)
//!   --pretty   Pretty-print JSON (default for tty)

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use beezap::logging::init_logging;
use beezap::{
    AmountInput, AttemptState, ConfirmOutcome, EventSynchronizationBus, FileSecretStore, FixedPriceSource,
    Network, PaymentAttempt, PaymentFlowOrchestrator, PriceConverter, SandboxBackend, Shutdown, SystemClock,
    WalletConfig, WalletSession, WalletSessionManager,
};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_SANDBOX_BALANCE: u64 = 100_000;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("beezap {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(command) = opts.command.clone() else {
        print_usage();
        return;
    };

    let result = tokio::runtime::Runtime::new()
        .context("failed to create runtime")
        .and_then(|rt| rt.block_on(run(&command, &opts)));

    let pretty = opts.pretty || (!opts.json && std::io::stdout().is_terminal());
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({"error": format!("{e:#}")}), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

async fn run(command: &str, opts: &ParsedArgs) -> Result<Value> {
    let ctx = Cli::new(opts)?;
    ctx.session.initialize_from_storage().await?;
    match command {
        "status" => Ok(session_json(&ctx.session.session())),
        "init" => cmd_init(&ctx, opts).await,
        "unlock" => cmd_unlock(&ctx, opts).await,
        "send" => cmd_send(&ctx, opts).await,
        "backup" => cmd_backup(&ctx, opts).await,
        "restore" => cmd_restore(&ctx, opts).await,
        "confirm-backup" => {
            ctx.session.confirm_backup().await?;
            Ok(session_json(&ctx.session.session()))
        }
        "delete" => {
            if !opts.yes {
                bail!("refusing to delete the wallet without --yes");
            }
            ctx.session.delete_wallet().await?;
            Ok(json!({"deleted": true}))
        }
        other => bail!("unknown command: {other}"),
    }
}

/// Wiring for one CLI invocation.
struct Cli {
    session: Arc<WalletSessionManager>,
    backend: SandboxBackend,
    prices: Arc<PriceConverter>,
}

impl Cli {
    fn new(opts: &ParsedArgs) -> Result<Self> {
        let mut config = WalletConfig::from_env();
        if let Some(app) = &opts.app {
            config.app = app.clone();
        }
        if let Some(network) = &opts.network {
            config.network = Network::from_str(network).ok_or_else(|| anyhow!("unknown network: {network}"))?;
        }
        if let Some(dir) = &opts.data_dir {
            config.data_dir = Some(dir.into());
        }

        let store = FileSecretStore::new(config.resolved_data_dir());
        debug!(dir = %store.dir().display(), "using data dir");

        let opening = env::var("BEEZAP_SANDBOX_BALANCE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SANDBOX_BALANCE);
        let backend = SandboxBackend::builder().opening_balance(opening).build();
        if let Ok(list) = env::var("BEEZAP_SANDBOX_RECIPIENTS") {
            for address in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                backend.register_recipient(address);
            }
        }

        let rate = env::var("BEEZAP_PRICE_RATE").ok().and_then(|v| v.parse::<f64>().ok());
        let currency = env::var("BEEZAP_PRICE_CURRENCY").unwrap_or_else(|_| "USD".into());
        let source = match rate {
            Some(rate) => FixedPriceSource::with_rate(rate, &currency),
            None => FixedPriceSource::new(None),
        };
        let prices = Arc::new(PriceConverter::from_config(Arc::new(source), &config));

        let session = Arc::new(WalletSessionManager::new(
            config,
            Arc::new(store),
            Arc::new(backend.clone()),
            Arc::new(SystemClock),
        ));
        Ok(Self { session, backend, prices })
    }
}

fn password(opts: &ParsedArgs) -> Result<String> {
    opts.password.clone().ok_or_else(|| anyhow!("--password is required (or set BEEZAP_PASSWORD)"))
}

fn session_json(session: &WalletSession) -> Value {
    serde_json::to_value(session).unwrap_or_else(|_| json!({"lifecycle": session.lifecycle.as_str()}))
}

async fn cmd_init(ctx: &Cli, opts: &ParsedArgs) -> Result<Value> {
    let words = ctx.session.create(&password(opts)?).await?;
    let session = ctx.session.session();
    Ok(json!({
        "mnemonic": words.expose(),
        "words": words.word_count(),
        "lifecycle": session.lifecycle.as_str(),
        "balance": session.balance(),
    }))
}

async fn cmd_unlock(ctx: &Cli, opts: &ParsedArgs) -> Result<Value> {
    let balance = ctx.session.unlock(&password(opts)?).await?;
    Ok(json!({"balance": balance, "session": session_json(&ctx.session.session())}))
}

async fn cmd_send(ctx: &Cli, opts: &ParsedArgs) -> Result<Value> {
    let address = opts.positional.first().ok_or_else(|| anyhow!("usage: beezap send <address> <amount>"))?;
    let amount = opts.positional.get(1).ok_or_else(|| anyhow!("usage: beezap send <address> <amount>"))?;
    if env::var("BEEZAP_SANDBOX_RECIPIENTS").is_err() {
        ctx.backend.register_recipient(address);
    }

    ctx.session.unlock(&password(opts)?).await?;
    let shutdown = Shutdown::new();
    let bus = Arc::new(EventSynchronizationBus::new(ctx.session.clone()));
    let mut notifications = bus.notifications();
    let bus_task = bus.spawn(shutdown.clone());

    let flow = PaymentFlowOrchestrator::open(ctx.session.clone(), ctx.prices.clone(), address).await;
    if let Some(comment) = &opts.comment {
        flow.set_comment(comment)?;
    }
    if flow.state() == AttemptState::SelectingAmount {
        let input = if opts.fiat {
            AmountInput::Fiat(amount.parse().with_context(|| format!("invalid fiat amount: {amount}"))?)
        } else {
            AmountInput::Native(amount.parse().with_context(|| format!("invalid amount: {amount}"))?)
        };
        match input {
            AmountInput::Native(sats) if flow.quick_amounts().contains(&sats) => {
                flow.select_quick_amount(sats).await?;
            }
            input => {
                flow.choose_custom()?;
                flow.enter_custom_amount(input).await?;
            }
        }
    }

    let mut requoted = None;
    if flow.state() == AttemptState::AwaitingConfirmation {
        let mut outcome = flow.confirm().await?;
        if let ConfirmOutcome::Requoted { previous_fee, .. } = &outcome {
            requoted = Some(*previous_fee);
            outcome = flow.confirm().await?;
        }
        debug!(?outcome, "confirm finished");
    }

    let notification = match tokio::time::timeout(Duration::from_millis(500), notifications.recv()).await {
        Ok(Ok(notification)) => serde_json::to_value(notification).ok(),
        _ => None,
    };
    shutdown.trigger();
    let _ = bus_task.await;

    let mut output = attempt_json(&flow.attempt());
    output["previous_fee"] = json!(requoted);
    output["notification"] = json!(notification);
    output["fiat"] = json!(flow.display_value(flow.attempt().amount.unwrap_or(0)).await.value());
    output["balance"] = json!(ctx.session.session().balance());
    Ok(output)
}

fn attempt_json(attempt: &PaymentAttempt) -> Value {
    json!({
        "state": attempt.state.as_str(),
        "recipient": attempt.recipient_address,
        "amount": attempt.amount,
        "fee": attempt.fee(),
        "comment": attempt.comment,
        "payment_id": attempt.receipt.as_ref().map(|r| r.payment_id.clone()),
        "error": attempt.error.as_ref().map(|e| e.to_string()),
    })
}

async fn cmd_backup(ctx: &Cli, opts: &ParsedArgs) -> Result<Value> {
    let sealed = ctx.session.export_backup().await?.ok_or_else(|| anyhow!("no wallet to back up"))?;
    match &opts.out {
        Some(path) => {
            tokio::fs::write(path, &sealed).await.with_context(|| format!("writing {path}"))?;
            Ok(json!({"written": path, "bytes": sealed.len()}))
        }
        None => Ok(json!({"backup": BASE64.encode(&sealed)})),
    }
}

async fn cmd_restore(ctx: &Cli, opts: &ParsedArgs) -> Result<Value> {
    let source = opts.positional.first().ok_or_else(|| anyhow!("usage: beezap restore <file>"))?;
    let sealed = tokio::fs::read(source).await.with_context(|| format!("reading {source}"))?;
    ctx.session.restore(&sealed, &password(opts)?).await?;
    Ok(session_json(&ctx.session.session()))
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    positional: Vec<String>,
    app: Option<String>,
    network: Option<String>,
    data_dir: Option<String>,
    password: Option<String>,
    comment: Option<String>,
    out: Option<String>,
    fiat: bool,
    yes: bool,
    json: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        // Load .env file if present
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    if !value.is_empty() && env::var(key.trim()).is_err() {
                        env::set_var(key.trim(), value);
                    }
                }
            }
        }

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let value = args.get(i + 1).cloned();
            let mut takes_value = |slot: &mut Option<String>| {
                if value.is_some() {
                    *slot = value.clone();
                    i += 1;
                }
            };
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--json" => opts.json = true,
                "--pretty" => opts.pretty = true,
                "--fiat" => opts.fiat = true,
                "--yes" | "-y" => opts.yes = true,
                "--app" | "-a" => takes_value(&mut opts.app),
                "--network" | "-n" => takes_value(&mut opts.network),
                "--data-dir" | "-d" => takes_value(&mut opts.data_dir),
                "--password" | "-p" => takes_value(&mut opts.password),
                "--comment" | "-c" => takes_value(&mut opts.comment),
                "--out" | "-o" => takes_value(&mut opts.out),
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }

        // First positional is command
        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }
        opts.positional = positional;

        // Environment variables (lower priority than CLI args)
        if opts.password.is_none() {
            opts.password = env::var("BEEZAP_PASSWORD").ok().filter(|s| !s.is_empty());
        }
        if opts.data_dir.is_none() {
            opts.data_dir = env::var("BEEZAP_DATA_DIR").ok().filter(|s| !s.is_empty());
        }

        opts
    }
}

fn print_usage() {
    println!(
        r#"beezap - zap wallet session CLI

USAGE:
    beezap <command> [args] [options]

COMMANDS:
    status                      Show session state
    init                        Create a new wallet (prints recovery words once)
    unlock                      Decrypt the seed and connect
    send <address> <amount>     Zap a lightning address or lnurl
    backup [--out <file>]       Export the sealed seed
    restore <file>              Replace the wallet with a sealed backup
    confirm-backup              Record that the recovery words are saved
    delete --yes                Lock and purge the wallet

OPTIONS:
    --password, -p <pw>         Wallet password (env: BEEZAP_PASSWORD)
    --comment, -c <text>        Zap comment (truncated to what the recipient accepts)
    --fiat                      Treat <amount> as fiat (needs BEEZAP_PRICE_RATE)
    --app, -a <name>            Application name (env: BEEZAP_APP)
    --network, -n <net>         mainnet|regtest (env: BEEZAP_NETWORK)
    --data-dir, -d <path>       Data directory (env: BEEZAP_DATA_DIR, BEEZAP_ROOT)

OUTPUT OPTIONS:
    --json                      Raw JSON output
    --pretty                    Pretty-print JSON
    --version, -V               Print version

SANDBOX:
    BEEZAP_SANDBOX_BALANCE      Opening balance per wallet (default: 100000)
    BEEZAP_SANDBOX_RECIPIENTS   Comma-separated registered addresses
                                (default: the send target is registered)

EXAMPLES:
    beezap init --password hunter22 --network regtest
    beezap send alice@example.com 1000 --comment "gm" --password hunter22
    beezap backup --out wallet.sealed"#
    );
}
