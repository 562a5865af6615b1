use growlight_common::{ConnectionCredentials, DeviceError, SettingsUpdate};

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Growlight Setup</title>
  <style>
    body { font-family: sans-serif; max-width: 24rem; margin: 2rem auto; padding: 0 1rem; }
    label, input, button { display: block; width: 100%; margin-top: 0.5rem; }
    input, button { padding: 0.5rem; box-sizing: border-box; }
  </style>
</head>
<body>
  <h1>Growlight Setup</h1>
  <p>Enter the Wi-Fi network this controller should join.</p>
  <form method="post" action="/save">
    <label for="networkName">Network name</label>
    <input id="networkName" name="networkName" maxlength="32" required />
    <label for="secret">Password</label>
    <input id="secret" name="secret" type="password" maxlength="64" />
    <button type="submit">Save and restart</button>
  </form>
</body>
</html>
"#;

pub const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Growlight</title>
  <style>
    body { font-family: sans-serif; max-width: 30rem; margin: 2rem auto; padding: 0 1rem; }
    dl { display: grid; grid-template-columns: auto 1fr; gap: 0.25rem 1rem; }
    label, input, button { display: block; margin-top: 0.5rem; }
  </style>
</head>
<body>
  <h1>Growlight</h1>
  <dl>
    <dt>Date</dt><dd id="date">-</dd>
    <dt>Time</dt><dd id="time">-</dd>
    <dt>Temperature</dt><dd id="temperature">-</dd>
    <dt>Humidity</dt><dd id="humidity">-</dd>
    <dt>Light</dt><dd id="light">-</dd>
    <dt>Output</dt><dd id="duty">-</dd>
  </dl>
  <form id="settings">
    <label>On <input type="time" name="onTime" required /></label>
    <label>Off <input type="time" name="offTime" required /></label>
    <label>Max intensity (%) <input type="number" name="maxIntensityPercent" min="0" max="100" required /></label>
    <button type="submit">Save</button>
    <p id="status"></p>
  </form>
  <script>
    const pick = (d, a, b) => (d[a] !== undefined ? d[a] : d[b]);
    let loaded = false;
    async function refresh() {
      const d = await (await fetch('/data.json')).json();
      document.getElementById('date').textContent = d.date;
      document.getElementById('time').textContent = d.time;
      document.getElementById('temperature').textContent = pick(d, 'temperatureC', 'temperatura') + ' °C';
      document.getElementById('humidity').textContent = pick(d, 'humidityPct', 'humidade') + ' %';
      document.getElementById('light').textContent = pick(d, 'lightRaw', 'luminosidade');
      document.getElementById('duty').textContent = d.dutyCycle + ' / 255';
      if (!loaded) {
        const f = document.getElementById('settings');
        f.onTime.value = pick(d, 'onTime', 'hora_ligar');
        f.offTime.value = pick(d, 'offTime', 'hora_desligar');
        f.maxIntensityPercent.value = pick(d, 'maxIntensityPercent', 'luz_maxima');
        loaded = true;
      }
    }
    document.getElementById('settings').addEventListener('submit', async (event) => {
      event.preventDefault();
      const body = new URLSearchParams(new FormData(event.target));
      const response = await fetch('/settings', { method: 'POST', body });
      const result = await response.json();
      document.getElementById('status').textContent = response.ok ? 'Saved' : result.error;
    });
    refresh();
    setInterval(refresh, 2000);
  </script>
</body>
</html>
"#;

pub fn saved_page(network_name: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\" /><title>Saved</title></head>\
         <body><h1>Saved</h1><p>Credentials for <strong>{}</strong> stored. \
         The controller restarts and joins the network in a few seconds.</p></body></html>",
        escape_html(network_name)
    )
}

pub fn failure_page(message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\" /><title>Not saved</title></head>\
         <body><h1>Not saved</h1><p>{}</p><p><a href=\"/\">Try again</a></p></body></html>",
        escape_html(message)
    )
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Decodes an `application/x-www-form-urlencoded` body.
pub fn decode_form(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => decoded.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(index + 1..index + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                if let Some(byte) = hex {
                    decoded.push(byte);
                    index += 2;
                } else {
                    decoded.push(b'%');
                }
            }
            other => decoded.push(other),
        }
        index += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn form_value<'a>(pairs: &'a [(String, String)], keys: &[&str]) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| keys.contains(&name.as_str()))
        .map(|(_, value)| value.as_str())
}

/// Credentials from the portal form. `ssid`/`pass` are accepted for older
/// setup pages.
pub fn credentials_from_form(pairs: &[(String, String)]) -> Option<ConnectionCredentials> {
    let network_name = form_value(pairs, &["networkName", "ssid"])?;
    let secret = form_value(pairs, &["secret", "pass"]).unwrap_or_default();
    Some(ConnectionCredentials::new(network_name.trim(), secret))
}

/// Settings from either a JSON object or a urlencoded form.
pub fn parse_settings(body: &str) -> Result<SettingsUpdate, DeviceError> {
    if body.trim_start().starts_with('{') {
        return serde_json::from_str(body)
            .map_err(|err| DeviceError::InvalidSettings(err.to_string()));
    }
    SettingsUpdate::from_pairs(&decode_form(body))
}

/// HTTP status for a rejected settings update: bad input is the client's
/// fault, a failed write is ours.
pub fn settings_error_status(err: &DeviceError) -> u16 {
    match err {
        DeviceError::InvalidSettings(_) => 400,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_urlencoded_pairs() {
        let pairs = decode_form("networkName=My+Home%20Wi-Fi&secret=p%26ss%3Dw0rd&empty=&flag");
        assert_eq!(
            pairs,
            vec![
                ("networkName".to_string(), "My Home Wi-Fi".to_string()),
                ("secret".to_string(), "p&ss=w0rd".to_string()),
                ("empty".to_string(), String::new()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert_eq!(decode_form("bad=%zz%4"), vec![("bad".to_string(), "%zz%4".to_string())]);
    }

    #[test]
    fn credentials_accept_legacy_field_names() {
        let current = credentials_from_form(&decode_form("networkName=garden&secret=pw")).unwrap();
        assert_eq!(current, ConnectionCredentials::new("garden", "pw"));

        let legacy = credentials_from_form(&decode_form("ssid=+garden+&pass=pw")).unwrap();
        assert_eq!(legacy, ConnectionCredentials::new("garden", "pw"));

        let open = credentials_from_form(&decode_form("networkName=cafe")).unwrap();
        assert_eq!(open.secret, "");

        assert_eq!(credentials_from_form(&decode_form("secret=pw")), None);
    }

    #[test]
    fn settings_parse_from_json_or_form() {
        let json = parse_settings(r#"{"onTime":"06:30","offTime":"20:00","maxIntensityPercent":70}"#)
            .unwrap();
        let form = parse_settings("onTime=06%3A30&offTime=20%3A00&maxIntensityPercent=70").unwrap();
        assert_eq!(json, form);

        let legacy = parse_settings("hora_ligar=06:30&hora_desligar=20:00&luz_maxima=70").unwrap();
        assert_eq!(legacy, form);

        assert!(parse_settings("{\"onTime\": 5}").is_err());
        assert!(parse_settings("onTime=06:30").is_err());
    }

    #[test]
    fn settings_errors_map_to_status() {
        let invalid = DeviceError::InvalidSettings("bad".to_string());
        let storage = DeviceError::persistence("schedule-settings", "flash full");
        assert_eq!(settings_error_status(&invalid), 400);
        assert_eq!(settings_error_status(&storage), 500);
    }

    #[test]
    fn pages_escape_user_input() {
        let page = saved_page("<script>alert('x')</script>");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
    }
}
