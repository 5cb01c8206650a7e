use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use services::{
    Blog, BlogConfig,
    services::setup_check::{self, AdminCredentials},
};
use utils::{
    logging::{LogFormat, init_tracing},
    sentry::{SentrySource, init_once},
};

/// Checks that the hosted platform project is ready to serve the blog.
///
/// Connection settings come from the BLOG_* environment variables.
#[derive(Parser, Debug)]
#[command(name = "setup-check", version)]
struct Args {
    /// Also verify that the administrator can sign in.
    #[arg(long, env = "BLOG_ADMIN_EMAIL", requires = "admin_password")]
    admin_email: Option<String>,

    #[arg(long, env = "BLOG_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Overrides BLOG_STORAGE_BUCKET.
    #[arg(long)]
    bucket: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    init_once(SentrySource::SetupCheck);
    init_tracing(if args.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let mut config = BlogConfig::from_env().context("failed to read configuration")?;
    if let Some(bucket) = args.bucket {
        config.settings.storage_bucket = bucket;
    }
    let blog = Blog::from_config(&config).context("failed to build backend client")?;

    let admin = match (args.admin_email, args.admin_password) {
        (Some(email), Some(password)) => Some(AdminCredentials {
            email,
            password: SecretString::new(password.into()),
        }),
        _ => None,
    };

    let report = setup_check::run(&blog, admin.as_ref()).await;

    for check in &report.checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("[{mark}] {:<26} {}", check.name, check.detail);
    }

    if report.all_passed() {
        println!("\nAll {} checks passed.", report.checks.len());
        Ok(ExitCode::SUCCESS)
    } else {
        let failed = report.failures().count();
        println!("\n{failed} of {} checks failed.", report.checks.len());
        Ok(ExitCode::FAILURE)
    }
}
