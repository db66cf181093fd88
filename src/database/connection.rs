use log::{error, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use tokio::time::Duration;
use url::Url;

use crate::error::DatabaseError;

const WAIT_BETWEEN_RETRIES: Duration = Duration::from_secs(5);

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, DatabaseError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_ca_file(sslrootcert_path)?;
    builder.set_verify(SslVerifyMode::NONE); // Self-signed server certificates

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Split `sslrootcert` out of the URL; tokio-postgres does not accept it
pub fn split_database_url(database_url: &str) -> Result<(String, String), DatabaseError> {
    let url = Url::parse(database_url)?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }
    let sslrootcert_path = sslrootcert_path.ok_or(DatabaseError::MissingRootCert)?;

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    Ok((clean_url.to_string(), sslrootcert_path))
}

/// Connect and run `operation`, reconnecting on failure up to `max_retries` times
pub async fn execute_with_retry<F, Fut, T>(
    database_url: &str,
    max_retries: usize,
    operation: F,
) -> Result<T, DatabaseError>
where
    F: Fn(tokio_postgres::Client) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<T, tokio_postgres::Error>> + Send,
{
    // A bad URL or certificate will not fix itself between attempts
    let (clean_database_url, sslrootcert_path) = split_database_url(database_url)?;
    let mut last_error = String::from("no attempt made");

    for attempt in 0..max_retries {
        match create_ssl_connector(&sslrootcert_path) {
            Ok(connector) => match tokio_postgres::connect(&clean_database_url, connector).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            error!("Connection error: {}", e);
                        }
                    });

                    match operation(client).await {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            error!("Attempt {}: query error: {}", attempt + 1, e);
                            last_error = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    error!("Attempt {}: connection error: {}", attempt + 1, e);
                    last_error = e.to_string();
                }
            },
            Err(e) => {
                error!("SSL connector error: {}", e);
                last_error = e.to_string();
            }
        }

        if attempt + 1 < max_retries {
            warn!("Retrying database operation in {}s", WAIT_BETWEEN_RETRIES.as_secs());
            tokio::time::sleep(WAIT_BETWEEN_RETRIES).await;
        }
    }

    Err(DatabaseError::RetriesExhausted {
        attempts: max_retries,
        last_error,
    })
}
