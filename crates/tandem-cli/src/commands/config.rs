use std::env;

use crate::cli::ConfigCommands;
use crate::config_profiles::{is_http_url, normalize_text_option, CliProfile, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            account_id,
            remote_url,
            auth_token,
            no_activate,
        } => run_config_init(global_profile, account_id, remote_url, auth_token, no_activate),
    }
}

#[allow(clippy::needless_pass_by_value)]
pub fn run_config_init(
    profile_name: Option<&str>,
    account_id: Option<String>,
    remote_url: Option<String>,
    auth_token: Option<String>,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);

    merge_profile(
        config.profile_mut_or_default(&profile_name),
        account_id,
        remote_url,
        auth_token,
        |key| env::var(key).ok(),
    )?;
    config.ensure_device_id(&profile_name);

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let profile = config
        .profile(&profile_name)
        .ok_or_else(|| CliError::Config("Failed to persist profile".to_string()))?;
    let mut missing_fields = Vec::new();
    if profile.account_id().is_none() {
        missing_fields.push("account_id");
    }
    if profile.remote_url().is_none() {
        missing_fields.push("remote_url");
    }
    if missing_fields.is_empty() {
        println!("Profile '{profile_name}' is ready. Run `tandem sync` to register and sync.");
    } else {
        println!(
            "Profile '{}' is missing: {} (edits stay local until configured)",
            profile_name,
            missing_fields.join(", ")
        );
    }

    Ok(())
}

/// Fill a profile from explicit values, then `TANDEM_*` variables, keeping
/// existing values otherwise.
pub fn merge_profile<F>(
    profile: &mut CliProfile,
    account_id: Option<String>,
    remote_url: Option<String>,
    auth_token: Option<String>,
    lookup: F,
) -> Result<(), CliError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = normalize_text_option(account_id)
        .or_else(|| normalize_text_option(lookup("TANDEM_ACCOUNT_ID")))
    {
        profile.account_id = Some(value);
    }
    if let Some(value) = normalize_text_option(remote_url)
        .or_else(|| normalize_text_option(lookup("TANDEM_REMOTE_URL")))
    {
        if !is_http_url(&value) {
            return Err(CliError::Config(
                "remote_url must include http:// or https://".to_string(),
            ));
        }
        profile.remote_url = Some(value.trim_end_matches('/').to_string());
    }
    if let Some(value) = normalize_text_option(auth_token)
        .or_else(|| normalize_text_option(lookup("TANDEM_AUTH_TOKEN")))
    {
        profile.auth_token = Some(value);
    }
    Ok(())
}
