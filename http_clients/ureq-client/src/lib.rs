use anyhow::Result;
use async_trait::async_trait;
use chatcore::net::{HttpClient, HttpRequest, HttpResponse};

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn execute_blocking(request: HttpRequest) -> Result<HttpResponse> {
    // The chat API is read-only over REST; posting goes over STOMP.
    if request.method != "GET" {
        return Err(anyhow::anyhow!("Unsupported HTTP method: {}", request.method));
    }
    let mut req = ureq::get(&request.url);
    for (key, value) in &request.headers {
        req = req.header(key, value);
    }
    let result = req.call();

    let response = match result {
        Ok(response) => response,
        // Non-2xx statuses are reported to the caller, not treated as I/O failures.
        Err(ureq::Error::StatusCode(status_code)) => {
            return Ok(HttpResponse {
                status_code,
                body: Vec::new(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let status_code = response.status().as_u16();
    let body = response.into_body().read_to_vec()?;
    Ok(HttpResponse { status_code, body })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::task::spawn_blocking(move || execute_blocking(request)).await?
    }
}
