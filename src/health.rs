use std::result::Result;

use prometheus::{Encoder, TextEncoder};
use warp::{
    reject::{self, Reject},
    Filter, Rejection, Reply,
};

#[allow(dead_code)]
#[derive(Debug)]
struct GatherError(prometheus::Error);

impl Reject for GatherError {}

pub async fn metrics() -> Result<impl Reply, Rejection> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|err| reject::custom(GatherError(err)))?;

    Ok(buffer)
}

pub fn routes() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let metrics = warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and_then(metrics);

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| "ok");

    metrics.or(healthz)
}
