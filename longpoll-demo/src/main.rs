//! Shared counters, configured and used through the URL.
//!
//! - `/new/<counter>/<row>/<row>/...` creates a counter with named rows
//! - `/count/<counter>` shows a counter; every viewer sees every click
//! - `/zero/<counter>` resets all rows
//! - `/del/<counter>` deletes a counter
#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;

use bui_longpoll::{
    CallbackResult, Context, Environment, PageOptions, Registry, Session, SessionOptions,
};

/// Viewers not heard from for this long are considered gone.
const ABANDONED_AFTER: Duration = Duration::from_secs(120);

const HELP: &str = "<pre>Shared counters

/new/COUNTER/ROW-1/ROW-2/...   create a counter
/count/COUNTER                 use a counter
/zero/COUNTER                  set all rows of a counter to zero
/del/COUNTER                   delete a counter
</pre>";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to accept browsers on.
    #[arg(long, env = "LONGPOLL_DEMO_ADDR", default_value = "127.0.0.1:3410")]
    addr: String,
    /// Interval of browser ticks in milliseconds (0 disables them).
    #[arg(long, default_value_t = 0)]
    poll_ms: u32,
}

struct Counter {
    rows: Vec<(String, i64)>,
}

/// All counters, and which sessions are looking at which counter.
#[derive(Clone, Default)]
struct Counters {
    inner: Arc<Mutex<CountersInner>>,
}

#[derive(Default)]
struct CountersInner {
    counters: HashMap<String, Counter>,
    viewers: Vec<(Session, String)>,
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl Counters {
    /// Show the page matching the session's URL.
    fn route(&self, session: &Session) -> bui_longpoll::Result<()> {
        let parts: Vec<&str> = session
            .path()
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();
        let page = match parts.as_slice() {
            ["new", name, rows @ ..] if !rows.is_empty() => {
                let mut inner = self.inner.lock();
                if inner.counters.contains_key(*name) {
                    "Bad URL. Counter already exists.".to_string()
                } else {
                    let rows = rows.iter().map(|r| (r.to_string(), 0)).collect();
                    inner.counters.insert(name.to_string(), Counter { rows });
                    info!("created counter {}", name);
                    format!("Created <a href=\"/count/{0}\">{0}</a>.", escape(name))
                }
            }
            ["count", name] => return self.show(session, name),
            ["zero", name] => {
                let mut inner = self.inner.lock();
                match inner.counters.get_mut(*name) {
                    Some(counter) => {
                        counter.rows.iter_mut().for_each(|row| row.1 = 0);
                        format!("Zeroed <a href=\"/count/{0}\">{0}</a>.", escape(name))
                    }
                    None => "Bad URL. Counter does not exist.".to_string(),
                }
            }
            ["del", name] => match self.inner.lock().counters.remove(*name) {
                Some(_) => "Counter deleted.".to_string(),
                None => "Bad URL. Counter does not exist.".to_string(),
            },
            _ => HELP.to_string(),
        };
        session.new_page(&page, Environment::new(), PageOptions::static_page())?;
        Ok(())
    }

    fn show(&self, session: &Session, name: &str) -> bui_longpoll::Result<()> {
        let html = {
            let inner = self.inner.lock();
            let Some(counter) = inner.counters.get(name) else {
                session.new_page(
                    "Bad URL. Counter does not exist.",
                    Environment::new(),
                    PageOptions::static_page(),
                )?;
                return Ok(());
            };
            let mut html = format!(
                "<style>.t{{font: 60px sans-serif;}} .b{{font: 80px sans-serif; color: green;}}</style>\
                 <p class=\"t\">{}</p><table class=\"t\">",
                escape(name)
            );
            for (i, (row, value)) in counter.rows.iter().enumerate() {
                html.push_str(&format!(
                    "<tr><td><input type=\"button\" value=\"+\" class=\"b\" rust-onclick()=\"add({i}, 1)\"/></td>\
                     <td id=\"v{i}\" align=\"right\">{value}</td>\
                     <td><input type=\"button\" value=\"-\" class=\"b\" rust-onclick()=\"add({i}, -1)\"/></td>\
                     <td>{row}</td></tr>",
                    i = i,
                    value = value,
                    row = escape(row),
                ));
            }
            html.push_str("</table>");
            html
        };

        let counters = self.clone();
        let counter_name = name.to_string();
        let env =
            Environment::new().handler("add", move |ctx: &Context| counters.add(ctx, &counter_name));
        session.new_page(&html, env, PageOptions::default())?;
        self.inner
            .lock()
            .viewers
            .push((session.clone(), name.to_string()));
        Ok(())
    }

    fn add(&self, ctx: &Context, name: &str) -> CallbackResult {
        let (row, amount) = match ctx.args() {
            [row, amount] => (
                row.as_u64().ok_or("row must be an index")? as usize,
                amount.as_i64().ok_or("amount must be an integer")?,
            ),
            _ => return Err("add expects (row, amount)".into()),
        };
        let mut inner = self.inner.lock();
        let value = {
            let counter = inner.counters.get_mut(name).ok_or("counter was deleted")?;
            let entry = counter.rows.get_mut(row).ok_or("no such row")?;
            entry.1 += amount;
            entry.1
        };
        let id = format!("v{}", row);
        inner.viewers.retain(|(session, _)| {
            if session.idle_time() > ABANDONED_AFTER {
                info!("session {} abandoned", session.id());
                session.close();
            }
            !session.is_closed()
        });
        for (session, viewing) in inner.viewers.iter() {
            if viewing != name {
                continue;
            }
            if let Err(e) = session.update([(id.as_str(), value.to_string())]) {
                warn!("cannot update session {}: {}", session.id(), e);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set environment variables from `.env` file, if it exists.
    dotenv::dotenv().ok();

    // Setup logging based on level in RUST_LOG environment variable.
    env_logger::init();

    let cli = Cli::parse();
    let registry = Registry::new(Default::default())?;
    let counters = Counters::default();
    let addr = registry.listen(&cli.addr).await?;
    let bound = addr.to_string();
    println!("Listening on http://{}/count/NAME (see http://{}/help)", addr, addr);

    loop {
        let options = SessionOptions {
            poll_interval_ms: cli.poll_ms,
            ..Default::default()
        };
        let session = registry.new_session(&bound, options).await?;
        if let Err(e) = counters.route(&session) {
            error!("session {}: {}", session.id(), e);
            session.close();
        }
    }
}
