use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use kvarto_http::{
    Body, ExponentialBackoff, HttpClient, HttpRequest, HttpResponse, HttpServer, RetryConfig,
};
use reqwest::{Method, StatusCode};

async fn shout(mut request: HttpRequest) -> kvarto_http::Result<HttpResponse> {
    let text = request.body.text().await?;
    let chunks = text
        .split_whitespace()
        .map(|word| Ok::<_, kvarto_http::Error>(Bytes::from(format!("{}\n", word.to_uppercase()))))
        .collect::<Vec<_>>();
    Ok(HttpResponse::new(StatusCode::OK).with_body(Body::from_stream(stream::iter(chunks))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let server = tokio::spawn(HttpServer::new().post("/shout", shout).serve(listener));

    let client = HttpClient::from_env().map_err(anyhow::Error::msg)?;
    let retry = RetryConfig::new(3)
        .with_backoff(ExponentialBackoff::new(Duration::from_millis(100), 2))
        .with_total_timeout(Duration::from_secs(5));
    let request = HttpRequest::parse(&format!("http://{address}/shout"))?
        .with_method(Method::POST)
        .with_body("streaming bodies with backpressure")
        .with_retry(retry);

    let mut response = client.send(request).await?;
    println!("status: {}", response.status);
    let mut content = response.body.content()?;
    while let Some(chunk) = content.next().await {
        print!("{}", String::from_utf8_lossy(&chunk?));
    }

    server.abort();
    Ok(())
}
