//! Registration of Kafka Connect connectors over the Connect REST API.
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("error building the connect client: {0}")]
    ClientError(reqwest::Error),
    #[error("connect request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    AlreadyExists,
    Created,
}

/// JDBC source connector reading a table into `<topic_prefix><table>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JdbcSourceConfig {
    #[serde(rename = "connector.class")]
    pub connector_class: String,
    #[serde(rename = "key.converter")]
    pub key_converter: String,
    #[serde(rename = "key.converter.schemas.enable")]
    pub key_converter_schemas_enable: String,
    #[serde(rename = "value.converter")]
    pub value_converter: String,
    #[serde(rename = "value.converter.schemas.enable")]
    pub value_converter_schemas_enable: String,
    #[serde(rename = "batch.max.rows")]
    pub batch_max_rows: String,
    #[serde(rename = "connection.url")]
    pub connection_url: String,
    #[serde(rename = "connection.user")]
    pub connection_user: String,
    #[serde(rename = "connection.password")]
    pub connection_password: String,
    #[serde(rename = "table.whitelist")]
    pub table_whitelist: String,
    pub mode: String,
    #[serde(rename = "incrementing.column.name")]
    pub incrementing_column_name: String,
    #[serde(rename = "topic.prefix")]
    pub topic_prefix: String,
    #[serde(rename = "poll.interval.ms")]
    pub poll_interval_ms: String,
}

impl JdbcSourceConfig {
    /// Incrementing-mode source with schemaless JSON keys and values.
    pub fn incrementing(
        connection_url: &str,
        user: &str,
        password: &str,
        table: &str,
        incrementing_column: &str,
        topic_prefix: &str,
    ) -> Self {
        const JSON_CONVERTER: &str = "org.apache.kafka.connect.json.JsonConverter";

        Self {
            connector_class: "io.confluent.connect.jdbc.JdbcSourceConnector".to_owned(),
            key_converter: JSON_CONVERTER.to_owned(),
            key_converter_schemas_enable: "false".to_owned(),
            value_converter: JSON_CONVERTER.to_owned(),
            value_converter_schemas_enable: "false".to_owned(),
            batch_max_rows: "500".to_owned(),
            connection_url: connection_url.to_owned(),
            connection_user: user.to_owned(),
            connection_password: password.to_owned(),
            table_whitelist: table.to_owned(),
            mode: "incrementing".to_owned(),
            incrementing_column_name: incrementing_column.to_owned(),
            topic_prefix: topic_prefix.to_owned(),
            poll_interval_ms: "3600000".to_owned(),
        }
    }

    pub fn batch_max_rows(mut self, rows: u32) -> Self {
        self.batch_max_rows = rows.to_string();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().to_string();
        self
    }

    /// Topic the connector writes the table to.
    pub fn topic(&self) -> String {
        format!("{}{}", self.topic_prefix, self.table_whitelist)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorDefinition {
    pub name: String,
    pub config: JdbcSourceConfig,
}

pub struct ConnectClient {
    base_url: String,
    client: reqwest::Client,
}

impl ConnectClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConnectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ConnectError::ClientError)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    /// Creates the connector unless Connect already knows it. Existing
    /// connectors are left untouched.
    pub async fn ensure_connector(
        &self,
        connector: &ConnectorDefinition,
    ) -> Result<ConnectorState, ConnectError> {
        let url = format!("{}/connectors/{}", self.base_url, connector.name);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::OK {
            info!(connector = %connector.name, "Connector already created, skipping");
            return Ok(ConnectorState::AlreadyExists);
        }
        debug!(
            connector = %connector.name,
            status = %response.status(),
            "Connector lookup did not find it, creating"
        );

        self.client
            .post(format!("{}/connectors", self.base_url))
            .json(connector)
            .send()
            .await?
            .error_for_status()?;

        info!(connector = %connector.name, "Connector created");
        Ok(ConnectorState::Created)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn stations_connector() -> ConnectorDefinition {
        ConnectorDefinition {
            name: "stations".to_owned(),
            config: JdbcSourceConfig::incrementing(
                "jdbc:postgresql://localhost:5432/cta",
                "cta_admin",
                "chicago",
                "stations",
                "stop_id",
                "cta.connect.",
            ),
        }
    }

    #[tokio::test]
    async fn skips_existing_connectors() {
        let server = MockServer::start();
        let lookup = server.mock(|when, then| {
            when.method(GET).path("/connectors/stations");
            then.status(200).json_body(serde_json::json!({"name": "stations"}));
        });
        let create = server.mock(|when, then| {
            when.method(POST).path("/connectors");
            then.status(201);
        });

        let client = ConnectClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let state = client.ensure_connector(&stations_connector()).await.unwrap();

        assert_eq!(state, ConnectorState::AlreadyExists);
        lookup.assert();
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn creates_missing_connectors() {
        let server = MockServer::start();
        let lookup = server.mock(|when, then| {
            when.method(GET).path("/connectors/stations");
            then.status(404);
        });
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/connectors")
                .header("content-type", "application/json")
                .body_contains(r#""name":"stations""#)
                .body_contains(r#""topic.prefix":"cta.connect.""#)
                .body_contains(r#""poll.interval.ms":"3600000""#);
            then.status(201);
        });

        let client = ConnectClient::new(&format!("{}/", server.base_url()), Duration::from_secs(5))
            .unwrap();
        let state = client.ensure_connector(&stations_connector()).await.unwrap();

        assert_eq!(state, ConnectorState::Created);
        lookup.assert();
        create.assert();
    }

    #[tokio::test]
    async fn rejected_creation_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/connectors/stations");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(POST).path("/connectors");
            then.status(409);
        });

        let client = ConnectClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let err = client
            .ensure_connector(&stations_connector())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::RequestError(e) if e.status() == Some(StatusCode::CONFLICT)));
    }

    #[test]
    fn jdbc_topic_is_prefix_and_table() {
        let config = stations_connector()
            .config
            .batch_max_rows(100)
            .poll_interval(Duration::from_secs(60));

        assert_eq!(config.topic(), "cta.connect.stations");
        assert_eq!(config.batch_max_rows, "100");
        assert_eq!(config.poll_interval_ms, "60000");
    }
}
