use std::fmt::Write;

use axum::response::Html;

use super::session::Flash;
use crate::service::activity::Activity;
use crate::service::catalog::{FOREX, STOCKS};
use crate::service::prediction::{ForexPrediction, PredictionRecord, StockPrediction};
use crate::service::usage::UsageSnapshot;
use crate::util::escape_html as esc;

const LAYOUT: &str = include_str!("../../../web/layout.html");

/// Common page frame: navigation for the current user plus pending messages.
pub struct Frame<'a> {
    pub user: Option<&'a str>,
    pub messages: Vec<Flash>,
}

impl Frame<'_> {
    pub fn render(&self, title: &str, content: &str) -> Html<String> {
        let nav = match self.user {
            Some(user) => format!(
                r#"<span>{}</span><a href="/dashboard">Dashboard</a><a href="/predict_stock">Stocks</a><a href="/predict_forex">Forex</a><a href="/profile">Profile</a><a href="/logout">Logout</a>"#,
                esc(user)
            ),
            None => r#"<a href="/login">Login</a><a href="/register">Register</a>"#.to_string(),
        };

        let mut messages = String::new();
        for message in &self.messages {
            let _ = write!(
                messages,
                r#"<div class="message {}">{}</div>"#,
                message.level.as_str(),
                esc(&message.text)
            );
        }

        Html(
            LAYOUT
                .replace("{{title}}", &esc(title))
                .replace("{{nav}}", &nav)
                .replace("{{messages}}", &messages)
                .replace("{{content}}", content),
        )
    }
}

fn error_line(error: Option<&str>) -> String {
    error
        .map(|e| format!(r#"<div class="message error">{}</div>"#, esc(e)))
        .unwrap_or_default()
}

pub fn home(frame: &Frame) -> Html<String> {
    let body = match frame.user {
        Some(user) => format!(
            r#"<h1>Welcome back, {}</h1><p>Pick a market to forecast.</p>
<p><a href="/predict_stock">Stock prediction</a> · <a href="/predict_forex">Forex prediction</a></p>"#,
            esc(user)
        ),
        None => r#"<h1>StockCast</h1><p>Next-day price forecasts for NSE stocks and major forex pairs.</p>
<p><a href="/login">Log in</a> or <a href="/register">create an account</a> to start.</p>"#
            .to_string(),
    };
    frame.render("Home", &body)
}

pub fn login(frame: &Frame, next: &str) -> Html<String> {
    let body = format!(
        r#"<h1>Log in</h1>
<form method="post" action="/login">
  <input type="hidden" name="next" value="{}">
  <label>Username <input name="username" autocomplete="username"></label>
  <label>Password <input type="password" name="password" autocomplete="current-password"></label>
  <button type="submit">Log in</button>
</form>
<p>No account? <a href="/register">Register</a></p>"#,
        esc(next)
    );
    frame.render("Log in", &body)
}

pub fn register(frame: &Frame) -> Html<String> {
    let body = r#"<h1>Create account</h1>
<form method="post" action="/register">
  <label>Username <input name="username" autocomplete="username"></label>
  <label>Email <input type="email" name="email" autocomplete="email"></label>
  <label>Password <input type="password" name="password" autocomplete="new-password"></label>
  <label>Confirm password <input type="password" name="confirm_password" autocomplete="new-password"></label>
  <button type="submit">Register</button>
</form>"#;
    frame.render("Register", body)
}

pub fn dashboard(frame: &Frame, username: &str, predictions: &[PredictionRecord]) -> Html<String> {
    let mut body = format!("<h1>Dashboard</h1><p>Signed in as <strong>{}</strong>.</p>", esc(username));
    if predictions.is_empty() {
        body.push_str("<p>No predictions yet.</p>");
    } else {
        body.push_str("<h2>Recent predictions</h2><table><tr><th>When</th><th>Type</th><th>Symbol</th><th>Value</th></tr>");
        for p in predictions {
            let _ = write!(
                body,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&p.timestamp),
                esc(&p.kind),
                esc(&p.subject),
                esc(&p.value)
            );
        }
        body.push_str("</table>");
    }
    frame.render("Dashboard", &body)
}

pub fn profile(
    frame: &Frame,
    username: &str,
    email: &str,
    activities: &[Activity],
) -> Html<String> {
    let mut body = format!(
        "<h1>Profile</h1><p><strong>{}</strong> &lt;{}&gt;</p><h2>Recent activity</h2>",
        esc(username),
        esc(email)
    );
    if activities.is_empty() {
        body.push_str("<p>No activity recorded.</p>");
    } else {
        body.push_str("<table><tr><th>When</th><th>Activity</th><th>IP</th></tr>");
        for a in activities {
            let _ = write!(
                body,
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&a.timestamp),
                esc(&a.activity),
                esc(&a.ip_address)
            );
        }
        body.push_str("</table>");
    }
    body.push_str(
        r#"<h2>Change password</h2>
<form method="post" action="/profile/password">
  <label>Current password <input type="password" name="current_password"></label>
  <label>New password <input type="password" name="new_password"></label>
  <label>Confirm new password <input type="password" name="confirm_password"></label>
  <button type="submit">Change password</button>
</form>"#,
    );
    frame.render("Profile", &body)
}

pub fn predict_stock(
    frame: &Frame,
    prediction: Option<&StockPrediction>,
    error: Option<&str>,
) -> Html<String> {
    let mut options = String::new();
    for (i, company) in STOCKS.iter().enumerate() {
        let selected = if prediction.is_some_and(|p| p.index == i) { " selected" } else { "" };
        let _ = write!(options, r#"<option value="{i}"{selected}>{}</option>"#, esc(company));
    }

    let result = prediction
        .map(|p| {
            format!(
                r#"<p class="result">{}: predicted close <strong>{:.2}</strong></p><p>Last close {:.2}, sentiment {:.2}</p>"#,
                esc(p.company),
                p.value,
                p.close,
                p.sentiment
            )
        })
        .unwrap_or_default();

    let body = format!(
        r#"<h1>Stock prediction</h1>{}
<form method="post" action="/predict_stock">
  <label>Company <select name="company_symbol">{options}</select></label>
  <button type="submit">Predict</button>
</form>{result}"#,
        error_line(error)
    );
    frame.render("Stock prediction", &body)
}

pub fn predict_forex(
    frame: &Frame,
    prediction: Option<&ForexPrediction>,
    error: Option<&str>,
) -> Html<String> {
    let mut options = String::new();
    for (i, pair) in FOREX.iter().enumerate() {
        let selected = if prediction.is_some_and(|p| p.index == i) { " selected" } else { "" };
        let _ = write!(options, r#"<option value="{i}"{selected}>{}</option>"#, esc(pair.name));
    }

    let result = prediction
        .map(|p| {
            format!(
                r#"<p class="result">{}: predicted <strong>{:.5}</strong></p><p>Last close {:.5}</p>"#,
                esc(p.pair),
                p.value,
                p.close
            )
        })
        .unwrap_or_default();

    let body = format!(
        r#"<h1>Forex prediction</h1>{}
<form method="post" action="/predict_forex">
  <label>Pair <select name="forex_symbol">{options}</select></label>
  <button type="submit">Predict</button>
</form>{result}"#,
        error_line(error)
    );
    frame.render("Forex prediction", &body)
}

pub fn api_usage(frame: &Frame, usage: &UsageSnapshot) -> Html<String> {
    let body = format!(
        r#"<h1>API usage</h1>
<table>
  <tr><th>API</th><th>Used</th><th>Limit</th></tr>
  <tr><td>News requests today</td><td>{}</td><td>{}</td></tr>
  <tr><td>Sentiment characters this month</td><td>{}</td><td>{}</td></tr>
</table>"#,
        usage.news_requests_today,
        usage.news_daily_limit,
        usage.sentiment_chars_this_month,
        usage.sentiment_monthly_limit
    );
    frame.render("API usage", &body)
}

pub fn error_page(title: &str, message: &str) -> Html<String> {
    Frame {
        user: None,
        messages: Vec::new(),
    }
    .render(title, &format!("<h1>{}</h1><p>{}</p>", esc(title), esc(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::http::session::Level;

    #[test]
    fn test_frame_escapes_and_shows_messages() {
        let frame = Frame {
            user: Some("<alice>"),
            messages: vec![Flash {
                level: Level::Success,
                text: "Login successful!".into(),
            }],
        };
        let Html(html) = frame.render("Home", "<p>body</p>");
        assert!(html.contains("&lt;alice&gt;"));
        assert!(html.contains(r#"<div class="message success">Login successful!</div>"#));
        assert!(html.contains("<p>body</p>"));
        assert!(html.contains("Home · StockCast"));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn test_anonymous_nav() {
        let frame = Frame {
            user: None,
            messages: Vec::new(),
        };
        let Html(html) = home(&frame);
        assert!(html.contains(r#"href="/login""#));
        assert!(!html.contains("Logout"));
    }

    #[test]
    fn test_stock_form_lists_catalog() {
        let frame = Frame {
            user: Some("bob"),
            messages: Vec::new(),
        };
        let Html(html) = predict_stock(&frame, None, Some("Invalid company_symbol."));
        assert!(html.contains(r#"<option value="48">WIPRO.NS</option>"#));
        assert!(html.contains("M&amp;M.NS"));
        assert!(html.contains("Invalid company_symbol."));
    }
}
