use anyhow::{anyhow, Context, Result};
use tiny_http::{Header, Response, Server};
use url::Url;

use unify_auth_bridge::{AuthBridge, OAuthConfig, OrganisationId, Platform, GOOGLE_SCOPES};
use unify_core::{UnifyConfig, UnifyPaths};

use crate::commands::{parse_platform, ready_client};
use crate::ui;

const SUCCESS_PAGE: &str =
    "<html><body><h1>Connected</h1><p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str =
    "<html><body><h1>Authorization failed</h1><p>Check the terminal for details.</p></body></html>";

pub async fn run(org: &OrganisationId, platform: &str, sync_after: bool) -> Result<()> {
    let platform = parse_platform(platform)?;
    if platform != Platform::Google {
        return Err(anyhow!(
            "{} connections are not supported yet",
            platform.display_name()
        ));
    }
    let client = ready_client().await?;

    let config = UnifyConfig::load(&UnifyPaths::from_env().config_path)?;
    let oauth = match config.google_oauth() {
        Some(oauth) => oauth,
        None => {
            println!();
            ui::info("No Google OAuth client configured. Create a Desktop client at");
            ui::info("https://console.cloud.google.com/apis/credentials and enable the Gmail and Drive APIs.");
            println!();
            let client_id = ui::prompt_password("Paste your Client ID")?;
            let client_secret = ui::prompt_password("Paste your Client Secret")?;
            OAuthConfig::google(client_id, client_secret, Some(config.redirect_uri()))
        }
    };

    let bridge = AuthBridge::new();
    let (auth_url, csrf) = bridge.authorize_url(&oauth, GOOGLE_SCOPES)?;

    let server = Server::http(("127.0.0.1", config.google.redirect_port))
        .map_err(|e| anyhow!("Failed to start callback server: {}", e))?;

    println!();
    ui::info("Opening browser for authorization...");
    if open::that(&auth_url).is_err() {
        ui::info("Could not open a browser. Visit this URL instead:");
        println!("    {}", auth_url);
    }

    let spinner = ui::spinner("Waiting for authorization...");
    let expected_state = csrf.secret().clone();
    let code = tokio::task::spawn_blocking(move || wait_for_code(&server, &expected_state))
        .await
        .context("callback listener stopped")??;
    spinner.finish_and_clear();

    let spinner = ui::spinner("Exchanging authorization code...");
    let credential = bridge.exchange_code(platform, &code, &oauth).await;
    spinner.finish_and_clear();
    let credential = credential?;

    client.store_credential(org, &credential).await?;
    ui::success(&format!("Connected {} for {}", platform.display_name(), org));

    if credential.refresh_token.is_none() {
        ui::info("No refresh token was issued; you will need to reconnect when this token expires.");
    } else if config.google_oauth().is_none() {
        ui::info("Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET for the daemon so it can refresh this token.");
    }

    if sync_after {
        crate::commands::sync::run(org, 600, false).await?;
    } else {
        ui::info("Run `unify sync` to pull recent mail.");
    }
    Ok(())
}

/// Block until the OAuth redirect arrives, answering stray requests with 404.
fn wait_for_code(server: &Server, expected_state: &str) -> Result<String> {
    for request in server.incoming_requests() {
        match parse_callback(request.url(), expected_state) {
            Ok(None) => {
                let _ = request.respond(Response::from_string("not found").with_status_code(404));
            }
            Ok(Some(code)) => {
                let _ = request.respond(html(SUCCESS_PAGE));
                return Ok(code);
            }
            Err(err) => {
                let _ = request.respond(html(FAILURE_PAGE).with_status_code(400));
                return Err(err);
            }
        }
    }
    Err(anyhow!("No callback received"))
}

fn html(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let response = Response::from_string(body);
    match Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..]) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

/// `Ok(None)` when the request is not the OAuth callback.
fn parse_callback(raw: &str, expected_state: &str) -> Result<Option<String>> {
    let url = Url::parse("http://127.0.0.1")?.join(raw)?;
    if url.path() != "/callback" {
        return Ok(None);
    }

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(anyhow!("Authorization denied: {}", value)),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(anyhow!("OAuth state mismatch; please retry"));
    }
    code.filter(|c| !c.is_empty())
        .map(Some)
        .ok_or_else(|| anyhow!("No authorization code in callback"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_code_is_decoded() {
        let code = parse_callback("/callback?state=abc&code=4%2F0Ab_xyz&scope=gmail", "abc").unwrap();
        assert_eq!(code.as_deref(), Some("4/0Ab_xyz"));
    }

    #[test]
    fn test_other_paths_are_ignored() {
        assert_eq!(parse_callback("/favicon.ico", "abc").unwrap(), None);
    }

    #[test]
    fn test_state_must_match() {
        let err = parse_callback("/callback?state=evil&code=x", "abc").unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
    }

    #[test]
    fn test_denied_consent() {
        let err = parse_callback("/callback?error=access_denied&state=abc", "abc").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }
}
