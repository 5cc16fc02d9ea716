/// Shell script a new endpoint runs once to trade its download token for a
/// connection bundle.
pub fn enrollment_script(public_url: &str, download_token: &str) -> String {
    format!(
        r#"#!/bin/sh
set -eu

WARDEN_URL={url}
DOWNLOAD_TOKEN={token}
BUNDLE_PATH="${{WARDEN_BUNDLE_PATH:-./warden-agent.json}}"

umask 077
curl -fsS -X POST "$WARDEN_URL/agents/bundle" \
    -H 'Content-Type: application/json' \
    -d "{{\"download_token\":\"$DOWNLOAD_TOKEN\"}}" \
    -o "$BUNDLE_PATH"

echo "warden: connection bundle written to $BUNDLE_PATH"
"#,
        url = shell_quote(public_url),
        token = shell_quote(download_token),
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::{enrollment_script, shell_quote};

    #[test]
    fn script_embeds_url_and_token() {
        let script = enrollment_script("https://warden.example.org", "wdl_abc");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("WARDEN_URL='https://warden.example.org'"));
        assert!(script.contains("DOWNLOAD_TOKEN='wdl_abc'"));
        assert!(script.contains("$WARDEN_URL/agents/bundle"));
    }

    #[test]
    fn single_quotes_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
