use crate::dispatch::DispatchEvent;
use crate::error::BackendError;
use crate::types::CanonicalPlate;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use url::Url;

const NUMBERS: &str = "numbers";
const PAYMENTS: &str = "payments";

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub payment_url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    Completed,
    Other(String),
}

impl OrderStatus {
    fn parse(status: &str) -> Self {
        if status == "completed" {
            OrderStatus::Completed
        } else {
            OrderStatus::Other(status.to_string())
        }
    }
}

/// The access-control backend. Callers decide what an `Err` means for each call.
pub trait Backend: Send + Sync + 'static {
    fn whitelist_check(
        &self,
        plate: &CanonicalPlate,
    ) -> impl Future<Output = Result<bool, BackendError>> + Send;

    fn payment_status(
        &self,
        plate: &CanonicalPlate,
    ) -> impl Future<Output = Result<bool, BackendError>> + Send;

    fn create_order(
        &self,
        plate: &CanonicalPlate,
        amount: f64,
    ) -> impl Future<Output = Result<Order, BackendError>> + Send;

    fn order_status(
        &self,
        order_id: &str,
    ) -> impl Future<Output = Result<OrderStatus, BackendError>> + Send;

    fn dispatch_event(
        &self,
        event: &DispatchEvent,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct PaidResponse {
    paid: bool,
}

#[derive(Serialize)]
struct OrderRequest<'a> {
    plate: &'a str,
    amount: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: Option<String>,
    #[serde(default)]
    payment_url: String,
}

#[derive(Deserialize)]
struct OrderStatusResponse {
    status: String,
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpBackend { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Malformed(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, BackendError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        read_json(response).await
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<reqwest::Response, BackendError> {
        debug!("POST {}", url);
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::Status(status.as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| BackendError::Malformed(e.to_string()))
}

impl Backend for HttpBackend {
    async fn whitelist_check(&self, plate: &CanonicalPlate) -> Result<bool, BackendError> {
        let url = self.endpoint(&[NUMBERS, plate.as_str(), "exists"])?;
        Ok(self.get_json::<ExistsResponse>(url).await?.exists)
    }

    async fn payment_status(&self, plate: &CanonicalPlate) -> Result<bool, BackendError> {
        let url = self.endpoint(&[PAYMENTS, "status", plate.as_str()])?;
        Ok(self.get_json::<PaidResponse>(url).await?.paid)
    }

    async fn create_order(&self, plate: &CanonicalPlate, amount: f64) -> Result<Order, BackendError> {
        let url = self.endpoint(&[PAYMENTS, "orders"])?;
        let request = OrderRequest {
            plate: plate.as_str(),
            amount,
        };
        let response = self.post_json(url, &request).await?;
        let order: OrderResponse = read_json(response).await?;
        match order.order_id {
            Some(order_id) if !order_id.is_empty() => Ok(Order {
                order_id,
                payment_url: order.payment_url,
            }),
            _ => Err(BackendError::Malformed("missing orderId".to_string())),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, BackendError> {
        let url = self.endpoint(&[PAYMENTS, "orders", order_id])?;
        let status: OrderStatusResponse = self.get_json(url).await?;
        Ok(OrderStatus::parse(&status.status))
    }

    async fn dispatch_event(&self, event: &DispatchEvent) -> Result<(), BackendError> {
        let url = self.endpoint(&[NUMBERS, "detections"])?;
        self.post_json(url, event).await.map(|_| ())
    }
}
