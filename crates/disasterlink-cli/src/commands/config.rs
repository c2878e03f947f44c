use std::env;
use std::path::PathBuf;

use crate::cli::ConfigCommands;
use crate::config_profiles::{is_http_url, normalize_text_option, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            profile,
            remote_url,
            db_path,
            no_activate,
        } => run_config_init(
            profile.as_deref().or(global_profile),
            remote_url,
            db_path,
            no_activate,
        ),
        ConfigCommands::Show { profile } => run_config_show(profile.as_deref().or(global_profile)),
    }
}

pub fn run_config_init(
    profile_name: Option<&str>,
    remote_url: Option<String>,
    db_path: Option<PathBuf>,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let env_remote_url = normalize_text_option(env::var("DLINK_REMOTE_URL").ok());
    let profile_name = apply_profile_init(
        &mut config,
        profile_name,
        remote_url.or(env_remote_url),
        db_path,
        no_activate,
    )?;

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let has_remote = config
        .profile(&profile_name)
        .and_then(|profile| profile.remote_url())
        .is_some();
    if has_remote {
        println!("Profile '{profile_name}' is ready. Run `dlink sync` once you have a connection.");
    } else {
        println!("Profile '{profile_name}' is missing: remote_url");
    }
    Ok(())
}

/// Merge explicit values into the named profile; returns the resolved name.
pub fn apply_profile_init(
    config: &mut CliProfilesConfig,
    profile_name: Option<&str>,
    remote_url: Option<String>,
    db_path: Option<PathBuf>,
    no_activate: bool,
) -> Result<String, CliError> {
    let profile_name = config.resolve_profile_name(profile_name);
    let remote_url = normalize_text_option(remote_url)
        .map(normalize_remote_url)
        .transpose()?;

    let profile = config.profile_mut_or_default(&profile_name);
    if let Some(url) = remote_url {
        profile.remote_url = Some(url);
    }
    if let Some(path) = db_path.filter(|path| !path.as_os_str().is_empty()) {
        profile.db_path = Some(path);
    }

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }
    Ok(profile_name)
}

pub fn normalize_remote_url(url: String) -> Result<String, CliError> {
    let normalized = normalize_text_option(Some(url))
        .ok_or_else(|| CliError::Config("remote_url must not be empty".to_string()))?;
    if !is_http_url(&normalized) {
        return Err(CliError::Config(
            "remote_url must include http:// or https://".to_string(),
        ));
    }
    Ok(normalized.trim_end_matches('/').to_string())
}

fn run_config_show(profile_name: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let Some(profile) = config.profile(&profile_name) else {
        println!("Profile '{profile_name}' is not configured.");
        return Ok(());
    };

    println!("profile:    {profile_name}");
    println!(
        "remote_url: {}",
        profile.remote_url().unwrap_or_else(|| "(unset)".to_string())
    );
    println!(
        "db_path:    {}",
        profile
            .db_path
            .as_ref()
            .map_or_else(|| "(default)".to_string(), |path| path.display().to_string())
    );
    Ok(())
}
