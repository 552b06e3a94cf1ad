mod account;
mod balance;
mod browser;
mod bypass;
mod cdk;
mod challenge;
mod checkin;
mod config;
mod headers;
mod http;
mod notify;
mod secrets;
mod session;
mod signin;
mod topup;
mod utils;

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::{error, info, warn};

use crate::account::{AccountRunner, MethodDetail};
use crate::balance::{generate_balance_hash, load_balance_hash, save_balance_hash, BalanceMap};
use crate::config::AppConfig;

// Custom Application Error Type
#[derive(Debug)]
enum AppError {
    Io(std::io::Error),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Io(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directory holding per-identity browser storage-state caches.
    #[clap(long, default_value = "storage-states")]
    storage_state_dir: PathBuf,

    /// File persisting the balance digest between runs.
    #[clap(long, default_value = "balance_hash.txt")]
    balance_hash_file: PathBuf,

    /// Seconds to wait between consecutive reward-code redemptions.
    #[clap(long, default_value_t = topup::TOPUP_INTERVAL.as_secs())]
    topup_interval: u64,

    /// Process only the account with this display name.
    #[clap(long)]
    only: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("error occurred during program execution: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32, AppError> {
    println!("newapi multi-account auto check-in started");
    println!("Execution time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));

    let app_config = AppConfig::load_from_env();
    info!("loaded {} provider(s)", app_config.providers.len());

    if app_config.accounts.is_empty() {
        error!("unable to load account configuration, exiting");
        return Ok(1);
    }
    info!("found {} account(s)", app_config.accounts.len());

    std::fs::create_dir_all(&args.storage_state_dir)?;

    let last_balance_hash = load_balance_hash(&args.balance_hash_file);
    let topup_interval = Duration::from_secs(args.topup_interval);

    let mut success_count = 0usize;
    let mut total_count = 0usize;
    let mut need_notify = false;
    let mut notification_content: Vec<String> = Vec::new();
    let mut current_balances = BalanceMap::new();

    // Accounts run strictly sequentially: each browser-driven phase owns
    // an isolated profile that must fully exit before the next begins.
    for (index, account_config) in app_config.accounts.iter().enumerate() {
        let account_key = format!("account_{}", index + 1);
        let account_name = account_config.display_name(index);

        if let Some(only) = &args.only {
            if only != &account_name {
                continue;
            }
        }

        let Some(provider) = app_config.provider(&account_config.provider) else {
            error!(
                "{}: provider {:?} configuration not found",
                account_name, account_config.provider
            );
            need_notify = true;
            notification_content.push(format!(
                "[FAIL] {}: provider '{}' configuration not found",
                account_name, account_config.provider
            ));
            continue;
        };

        info!("processing {} using provider {:?}", account_name, provider.name);
        let runner = AccountRunner {
            account_name: account_name.clone(),
            account: account_config,
            provider,
            global_proxy: app_config.global_proxy.as_ref(),
            storage_dir: &args.storage_state_dir,
            topup_interval,
        };
        let results = runner.execute().await;
        total_count += results.len();

        let mut account_report = format!("{} summary:\n", account_name);
        let mut account_quotas = Vec::new();
        let mut failed_methods = 0usize;
        for result in &results {
            match &result.detail {
                MethodDetail::Balance(user_info) if result.success => {
                    success_count += 1;
                    account_report.push_str(&format!(
                        "  [OK] {} authentication\n       {}\n",
                        result.method, user_info.display
                    ));
                    account_quotas.push(user_info.quota);
                }
                MethodDetail::Error(error) => {
                    failed_methods += 1;
                    account_report.push_str(&format!(
                        "  [FAIL] {} authentication\n       {}\n",
                        result.method, error
                    ));
                }
                MethodDetail::Balance(_) => {}
            }
        }

        if !account_quotas.is_empty() {
            current_balances.insert(account_key, account_quotas);
        }

        match account::summarize(&results) {
            account::RunStatus::Failed if !results.is_empty() => {
                need_notify = true;
                warn!("{}: all authentication methods failed", account_name);
            }
            account::RunStatus::Partial => {
                need_notify = true;
                warn!("{}: some authentication methods failed", account_name);
            }
            _ => {}
        }

        account_report.push_str(&format!(
            "  {}/{} methods successful",
            results.len() - failed_methods,
            results.len()
        ));
        notification_content.push(account_report);
    }

    // A changed (or first) balance digest is itself worth a notification.
    let current_balance_hash = if current_balances.is_empty() {
        None
    } else {
        Some(generate_balance_hash(&current_balances))
    };
    info!(
        "current balance hash: {:?}, last balance hash: {:?}",
        current_balance_hash, last_balance_hash
    );
    if let Some(current) = &current_balance_hash {
        match &last_balance_hash {
            None => {
                need_notify = true;
                info!("first run detected, will notify with current balances");
            }
            Some(last) if last != current => {
                need_notify = true;
                info!("balance changes detected, will notify");
            }
            Some(_) => info!("no balance changes detected"),
        }
        save_balance_hash(&args.balance_hash_file, current);
    }

    let mut summary = vec![
        "Check-in result statistics:".to_string(),
        format!("Success: {}/{}", success_count, total_count),
        format!("Failed: {}/{}", total_count - success_count, total_count),
    ];
    if total_count > 0 && success_count == total_count {
        summary.push("All accounts checked in successfully".to_string());
    } else if success_count > 0 {
        summary.push("Some accounts checked in successfully".to_string());
    } else {
        summary.push("All accounts failed to check in".to_string());
    }

    let report = format!(
        "Execution time: {}\n\n{}\n\n{}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        notification_content.join("\n-------------------------------\n"),
        summary.join("\n")
    );
    println!("\n{}", report);

    if need_notify && !notification_content.is_empty() {
        notify::push_message("Check-in Alert", &report).await;
    } else {
        info!("all accounts successful and no balance changes, notification skipped");
    }

    Ok(if success_count > 0 { 0 } else { 1 })
}
