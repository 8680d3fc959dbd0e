//! Milvus HTTP v2 client.
//!
//! Speaks the `/v2/vectordb` REST surface: has/create/describe/load for
//! collections, insert for rows, search for the chat-time path. HTTP clients
//! are shared per (uri, token, db) triple and a failed request is re-sent
//! once before the error propagates.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, trace, warn};

use silt_core::config::VectorStoreConfig;

use super::{EnsureOutcome, SearchHit, StoreError, UpsertOutcome, VectorRow, VectorSink};

fn client_pool() -> &'static Mutex<HashMap<String, reqwest::Client>> {
  static POOL: OnceLock<Mutex<HashMap<String, reqwest::Client>>> = OnceLock::new();
  POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Production vector sink backed by a Milvus-compatible server.
#[derive(Debug, Clone)]
pub struct MilvusClient {
  http: reqwest::Client,
  config: VectorStoreConfig,
}

impl MilvusClient {
  /// Connect (or reuse a pooled client) for the given store config.
  pub fn connect(config: VectorStoreConfig) -> Self {
    let key = format!(
      "{}|{}|{}",
      config.uri,
      config.token.as_deref().unwrap_or(""),
      config.db.as_deref().unwrap_or("_default")
    );

    let http = match client_pool().lock() {
      Ok(mut pool) => pool.entry(key).or_insert_with(reqwest::Client::new).clone(),
      Err(_) => reqwest::Client::new(),
    };

    Self { http, config }
  }

  pub fn collection(&self) -> &str {
    &self.config.collection
  }

  fn endpoint(&self, path: &str) -> String {
    format!("{}/v2/vectordb/{path}", self.config.uri.trim_end_matches('/'))
  }

  fn with_db(&self, mut body: Value) -> Value {
    if let Some(db) = &self.config.db
      && let Some(map) = body.as_object_mut()
    {
      map.insert("dbName".to_string(), json!(db));
    }
    body
  }

  async fn send(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
    let mut request = self.http.post(self.endpoint(path)).json(body);
    if let Some(token) = &self.config.token {
      request = request.header("Authorization", format!("Bearer {token}"));
    }
    let response = request.send().await?;
    let envelope: Value = response.json().await?;

    let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 0 {
      let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_string();
      return Err(StoreError::Server { code, message });
    }

    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
  }

  /// Send with a single reconnect-style retry on transport failure.
  async fn post(&self, path: &str, body: Value) -> Result<Value, StoreError> {
    let body = self.with_db(body);
    match self.send(path, &body).await {
      Err(StoreError::Request(e)) => {
        warn!(path, error = %e, "vector store request failed, retrying once");
        self.send(path, &body).await
      }
      other => other,
    }
  }

  async fn has_collection(&self) -> Result<bool, StoreError> {
    let data = self
      .post("collections/has", json!({ "collectionName": self.config.collection }))
      .await?;
    Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
  }

  /// Dimension of the configured vector field on the existing collection.
  async fn described_dim(&self) -> Result<Option<usize>, StoreError> {
    let data = self
      .post("collections/describe", json!({ "collectionName": self.config.collection }))
      .await?;

    let fields = data
      .get("fields")
      .and_then(Value::as_array)
      .ok_or_else(|| StoreError::Unexpected("describe response missing fields".to_string()))?;

    for field in fields {
      let name = field.get("name").and_then(Value::as_str);
      if name != Some(self.config.vector_field.as_str()) {
        continue;
      }
      // dim may appear directly or inside the type params, depending on the
      // server version
      if let Some(dim) = field.get("dim").and_then(Value::as_u64) {
        return Ok(Some(dim as usize));
      }
      if let Some(params) = field.get("params").and_then(Value::as_array) {
        for param in params {
          if param.get("key").and_then(Value::as_str) == Some("dim") {
            let dim = param
              .get("value")
              .and_then(Value::as_str)
              .and_then(|v| v.parse::<usize>().ok());
            return Ok(dim);
          }
        }
      }
    }

    Ok(None)
  }

  async fn create_collection(&self, dim: usize) -> Result<(), StoreError> {
    let mut fields = vec![
      json!({
        "fieldName": "pk",
        "dataType": "Int64",
        "isPrimary": true,
      }),
      json!({
        "fieldName": self.config.text_field,
        "dataType": "VarChar",
        "elementTypeParams": { "max_length": "8192" },
      }),
      json!({
        "fieldName": self.config.vector_field,
        "dataType": "FloatVector",
        "elementTypeParams": { "dim": dim.to_string() },
      }),
    ];
    if let Some(metadata_field) = &self.config.metadata_field {
      fields.push(json!({
        "fieldName": metadata_field,
        "dataType": "VarChar",
        "elementTypeParams": { "max_length": "8192" },
      }));
    }

    let body = json!({
      "collectionName": self.config.collection,
      "schema": {
        "autoId": true,
        "enableDynamicField": false,
        "fields": fields,
      },
      "indexParams": [{
        "fieldName": self.config.vector_field,
        "indexName": format!("{}_idx", self.config.vector_field),
        "metricType": self.config.metric_type.as_str(),
        "indexType": "IVF_FLAT",
        "params": { "nlist": 1024 },
      }],
    });

    self.post("collections/create", body).await?;
    Ok(())
  }

  async fn load_collection(&self) -> Result<(), StoreError> {
    self
      .post("collections/load", json!({ "collectionName": self.config.collection }))
      .await?;
    Ok(())
  }

  /// Nearest-neighbor search over the collection, used at chat time.
  pub async fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<SearchHit>, StoreError> {
    let body = json!({
      "collectionName": self.config.collection,
      "data": [query_vector],
      "annsField": self.config.vector_field,
      "limit": top_k,
      "outputFields": [self.config.text_field],
    });

    let data = self.post("entities/search", body).await?;
    let rows = data
      .as_array()
      .ok_or_else(|| StoreError::Unexpected("search response is not an array".to_string()))?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in rows {
      let text = row
        .get(&self.config.text_field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      let score = row.get("distance").and_then(Value::as_f64).unwrap_or_default() as f32;
      hits.push(SearchHit { text, score });
    }
    Ok(hits)
  }
}

#[async_trait]
impl VectorSink for MilvusClient {
  async fn ensure_collection(&self, dim: usize) -> Result<EnsureOutcome, StoreError> {
    if self.has_collection().await? {
      if let Some(existing) = self.described_dim().await?
        && existing != dim
      {
        return Err(StoreError::DimensionMismatch {
          collection: existing,
          rows: dim,
        });
      }
      self.load_collection().await?;
      debug!(collection = %self.config.collection, dim, "collection already exists");
      return Ok(EnsureOutcome::Exists);
    }

    self.create_collection(dim).await?;
    self.load_collection().await?;
    info!(collection = %self.config.collection, dim, metric = self.config.metric_type.as_str(), "created collection");
    Ok(EnsureOutcome::Created)
  }

  async fn upsert(&self, rows: Vec<VectorRow>) -> Result<UpsertOutcome, StoreError> {
    let requested_count = rows.len();
    if requested_count == 0 {
      return Ok(UpsertOutcome {
        inserted_count: 0,
        requested_count: 0,
      });
    }

    let data: Vec<Value> = rows
      .into_iter()
      .map(|row| {
        let mut object = serde_json::Map::new();
        object.insert(self.config.text_field.clone(), json!(row.text));
        object.insert(self.config.vector_field.clone(), json!(row.embedding));
        if let Some(metadata_field) = &self.config.metadata_field {
          object.insert(metadata_field.clone(), json!(row.metadata.unwrap_or_default()));
        }
        Value::Object(object)
      })
      .collect();

    let start = Instant::now();
    let body = json!({
      "collectionName": self.config.collection,
      "data": data,
    });
    let response = self.post("entities/insert", body).await?;

    let inserted_count = response
      .get("insertCount")
      .and_then(Value::as_u64)
      .map(|n| n as usize)
      .unwrap_or(requested_count);

    // Flush so the rows are durable; a flush hiccup is not worth failing an
    // otherwise-successful insert.
    if let Err(e) = self
      .post("collections/flush", json!({ "collectionName": self.config.collection }))
      .await
    {
      warn!(collection = %self.config.collection, error = %e, "flush after insert failed");
    }

    trace!(
      inserted_count,
      requested_count,
      elapsed_ms = start.elapsed().as_millis(),
      "insert complete"
    );

    Ok(UpsertOutcome {
      inserted_count,
      requested_count,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use silt_core::config::MetricType;

  fn config() -> VectorStoreConfig {
    serde_json::from_str(r#"{ "uri": "http://localhost:19530/", "collection": "docs" }"#).unwrap()
  }

  #[test]
  fn endpoints_are_rooted_under_v2() {
    let client = MilvusClient::connect(config());
    assert_eq!(
      client.endpoint("collections/create"),
      "http://localhost:19530/v2/vectordb/collections/create"
    );
  }

  #[test]
  fn db_name_is_attached_when_configured() {
    let mut cfg = config();
    cfg.db = Some("tenant_7".to_string());
    let client = MilvusClient::connect(cfg);
    let body = client.with_db(json!({ "collectionName": "docs" }));
    assert_eq!(body["dbName"], json!("tenant_7"));

    let client = MilvusClient::connect(config());
    let body = client.with_db(json!({ "collectionName": "docs" }));
    assert!(body.get("dbName").is_none());
  }

  #[test]
  fn metric_types_serialize_to_wire_names() {
    assert_eq!(MetricType::Ip.as_str(), "IP");
    assert_eq!(MetricType::Cosine.as_str(), "COSINE");
    assert_eq!(MetricType::L2.as_str(), "L2");
  }
}
