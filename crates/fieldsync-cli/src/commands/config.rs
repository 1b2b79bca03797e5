use std::path::PathBuf;

use fieldsync_core::util::normalize_text_option;

use crate::cli::ConfigCommands;
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

/// Values supplied to `config init`
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub remote_url: Option<String>,
    pub auth_token: Option<String>,
    pub database: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub no_auto_merge: bool,
}

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            remote_url,
            auth_token,
            database,
            batch_size,
            no_auto_merge,
            no_activate,
        } => {
            let update = ProfileUpdate {
                remote_url,
                auth_token,
                database,
                batch_size,
                no_auto_merge,
            };
            run_config_init(global_profile, update, no_activate)
        }
        ConfigCommands::Show { json } => run_config_show(global_profile, json),
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    update: ProfileUpdate,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    apply_profile_update(config.profile_mut_or_default(&profile_name), update)?;

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let has_remote = config
        .profile(&profile_name)
        .and_then(CliProfile::remote_url)
        .is_some();
    if has_remote {
        println!("Profile '{profile_name}' is ready. Run `fieldsync sync`.");
    } else {
        println!("Profile '{profile_name}' is missing: remote_url");
    }
    Ok(())
}

/// Merge explicit values into a stored profile and validate the result.
pub fn apply_profile_update(profile: &mut CliProfile, update: ProfileUpdate) -> Result<(), CliError> {
    if let Some(url) = normalize_text_option(update.remote_url) {
        profile.remote_url = Some(url);
    }
    if let Some(token) = normalize_text_option(update.auth_token) {
        profile.auth_token = Some(token);
    }
    if let Some(database) = update.database {
        profile.database = Some(database);
    }
    if let Some(batch_size) = update.batch_size {
        profile.sync.batch_size = batch_size;
    }
    if update.no_auto_merge {
        profile.sync.auto_merge_disjoint = false;
    }

    profile.validate().map_err(CliError::Config)
}

fn run_config_show(profile_name: Option<&str>, as_json: bool) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let mut profile = config.profile(&profile_name).cloned().unwrap_or_default();
    profile.auth_token = profile.auth_token.map(|_| "[REDACTED]".to_string());

    if as_json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    println!("Profile:      {profile_name}");
    println!(
        "Remote:       {}",
        profile.remote_url().unwrap_or_else(|| "(not configured)".to_string())
    );
    println!(
        "Auth token:   {}",
        if profile.auth_token().is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!(
        "Database:     {}",
        profile
            .database
            .as_ref()
            .map_or_else(|| "(default)".to_string(), |path| path.display().to_string())
    );
    println!("Batch size:   {}", profile.sync.batch_size);
    println!("Auto-merge:   {}", profile.sync.auto_merge_disjoint);
    Ok(())
}
