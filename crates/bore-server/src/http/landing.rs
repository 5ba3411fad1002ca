//! Pages served on the server's own domain.

use super::{empty, full, ProxyBody};
use crate::metrics::{TrafficSink, TunnelTraffic};
use crate::tunnel::Registry;
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use url::form_urlencoded;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>bore</title></head>
<body>
<h1>bore</h1>
<p>Expose a local port to the internet through a tunnel.</p>
<pre>bore --server DOMAIN --local-port 3000</pre>
</body>
</html>
"#;

const NOT_FOUND_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Tunnel not found</title></head>
<body>
<h1>Tunnel not found</h1>
<p>No tunnel is registered as <code>{id}</code>. It may have disconnected.</p>
</body>
</html>
"#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TunnelSummary {
    id: String,
    url: String,
    port: u16,
    traffic: TunnelTraffic,
}

/// Answer a request addressed to the server's own domain.
pub(crate) async fn serve<B>(
    req: &Request<B>,
    domain: &str,
    registry: &Registry,
    sink: &dyn TrafficSink,
) -> Response<ProxyBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }

    match req.uri().path() {
        "/" => html(StatusCode::OK, INDEX_HTML.to_string()),
        "/not-found" => {
            let id = query_param(req.uri().query().unwrap_or(""), "tunnelID").unwrap_or_default();
            html(
                StatusCode::NOT_FOUND,
                NOT_FOUND_HTML.replace("{id}", &escape_html(&id)),
            )
        }
        "/api/tunnels" => {
            let summaries: Vec<TunnelSummary> = registry
                .routes()
                .await
                .into_iter()
                .map(|route| TunnelSummary {
                    url: format!("http://{}.{domain}", route.id),
                    port: route.port,
                    traffic: sink.traffic(&route.id).unwrap_or_default(),
                    id: route.id,
                })
                .collect();
            match serde_json::to_vec(&summaries) {
                Ok(json) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, "application/json")
                    .body(full(json))
                    .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "")),
                Err(_) => plain(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed\n"),
            }
        }
        _ => plain(StatusCode::NOT_FOUND, "not found\n"),
    }
}

/// 301 to the not-found page for `id` on the server's own domain.
pub(crate) fn redirect_not_found(scheme: &str, domain: &str, id: &str) -> Response<ProxyBody> {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("tunnelID", id)
        .finish();
    let location = format!("{scheme}://{domain}/not-found?{query}");
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(empty())
        .unwrap_or_else(|_| plain(StatusCode::NOT_FOUND, "tunnel not found\n"))
}

pub(crate) fn plain(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn html(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}

fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TrafficLedger;
    use crate::tunnel::TunnelSession;
    use http_body_util::BodyExt;

    async fn body_text(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn landing_and_unknown_paths() {
        let registry = Registry::new();
        let ledger = TrafficLedger::new();

        let resp = serve(&get("/"), "example.com", &registry, &ledger).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("<h1>bore</h1>"));

        let resp = serve(&get("/nope"), "example.com", &registry, &ledger).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn not_found_page_escapes_id() {
        let registry = Registry::new();
        let ledger = TrafficLedger::new();

        let req = get("/not-found?tunnelID=%3Cscript%3E");
        let resp = serve(&req, "example.com", &registry, &ledger).await;
        let text = body_text(resp).await;
        assert!(text.contains("&lt;script&gt;"));
        assert!(!text.contains("<script>"));
    }

    #[tokio::test]
    async fn api_lists_live_tunnels_with_traffic() {
        let registry = Registry::new();
        let ledger = TrafficLedger::new();
        let (session, _rx) = TunnelSession::detached("abc");
        registry.register(&session, "127.0.0.1", 55001).await;
        ledger.record_traffic("abc", 7, 70);

        let resp = serve(&get("/api/tunnels"), "example.com", &registry, &ledger).await;
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json[0]["id"], "abc");
        assert_eq!(json[0]["url"], "http://abc.example.com");
        assert_eq!(json[0]["port"], 55001);
        assert_eq!(json[0]["traffic"]["bytesOut"], 70);
    }

    #[test]
    fn redirect_points_at_own_domain() {
        let resp = redirect_not_found("https", "example.com", "no such");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers()[LOCATION],
            "https://example.com/not-found?tunnelID=no+such"
        );

        let resp = redirect_not_found("http", "example.com", "a&b=c");
        assert_eq!(
            resp.headers()[LOCATION],
            "http://example.com/not-found?tunnelID=a%26b%3Dc"
        );
    }

    #[test]
    fn query_param_decodes_values() {
        assert_eq!(query_param("tunnelID=a%20b+c", "tunnelID").as_deref(), Some("a b c"));
        assert_eq!(query_param("x=1&tunnelID=abc-123", "tunnelID").as_deref(), Some("abc-123"));
        assert_eq!(query_param("bad%zz=1", "tunnelID"), None);
        assert_eq!(query_param("", "tunnelID"), None);
    }
}
