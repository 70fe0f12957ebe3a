//! This module provides functionality for reading granules from HTTP(S)
//! object storage with ranged requests.
//!
//! The server must honour `Range` headers: a partial read that comes back
//! without `206 Partial Content` and a matching `Content-Range` is treated as
//! an error, not silently accepted, because the block cache depends on exact
//! ranges.

use super::DataReaderTrait;
use crate::types::{Blob, ByteRange};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use reqwest::{Client, Method, Request, StatusCode, Url};
use std::time::Duration;

/// A struct that provides reading capabilities from an HTTP(S) endpoint.
#[derive(Debug)]
pub struct DataReaderHttp {
	client: Client,
	name: String,
	url: Url,
}

impl DataReaderHttp {
	/// Creates a `DataReaderHttp` from a URL.
	pub fn from_url(url: Url) -> Result<Box<DataReaderHttp>> {
		match url.scheme() {
			"http" | "https" => (),
			_ => bail!("url has wrong scheme {url}"),
		}

		let client = Client::builder()
			.tcp_keepalive(Duration::from_secs(600))
			.timeout(Duration::from_secs(120))
			.build()?;

		Ok(Box::new(DataReaderHttp {
			client,
			name: url.to_string(),
			url,
		}))
	}
}

#[async_trait]
impl DataReaderTrait for DataReaderHttp {
	async fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		let ctx = || format!("while reading range {range} of {}", self.url);

		let mut request = Request::new(Method::GET, self.url.clone());
		let request_range: String = format!("bytes={}-{}", range.offset, range.length + range.offset - 1);
		request
			.headers_mut()
			.append("range", request_range.parse().with_context(ctx)?);

		let response = self.client.execute(request).await.with_context(ctx)?;

		if response.status() != StatusCode::PARTIAL_CONTENT {
			let status_code = response.status();
			bail!("expected 206 as a response to a range request, got {status_code}, {}", ctx());
		}

		let content_range: &str = match response.headers().get("content-range") {
			Some(header_value) => header_value.to_str().with_context(ctx)?,
			None => bail!("content-range header is not set in response headers, {}", ctx()),
		};

		lazy_static! {
			static ref RE_RANGE: Regex = RegexBuilder::new(r"^bytes (\d+)-(\d+)/\d+$")
				.case_insensitive(true)
				.build()
				.unwrap();
		}

		let (content_range_start, content_range_end) = {
			let caps = RE_RANGE
				.captures(content_range)
				.ok_or_else(|| anyhow!("invalid content-range header: {content_range}"))
				.with_context(ctx)?;
			(
				caps[1].parse::<u64>().with_context(ctx)?,
				caps[2].parse::<u64>().with_context(ctx)?,
			)
		};

		if content_range_start != range.offset {
			bail!("content-range-start {content_range_start} is not start of range, {}", ctx());
		}

		if content_range_end != range.offset + range.length - 1 {
			bail!("content-range-end {content_range_end} is not end of range, {}", ctx());
		}

		let bytes = response.bytes().await.with_context(ctx)?;

		Ok(Blob::from(&*bytes))
	}

	async fn read_all(&self) -> Result<Blob> {
		let ctx = || format!("while reading all data from {}", self.url);
		let response = self.client.get(self.url.clone()).send().await.with_context(ctx)?;
		if !response.status().is_success() {
			let status = response.status();
			bail!("expected successful response, got {status}, {}", ctx());
		}
		let bytes = response.bytes().await.with_context(ctx)?;
		Ok(Blob::from(&*bytes))
	}

	async fn get_size(&self) -> Result<u64> {
		let ctx = || format!("while asking for the size of {}", self.url);
		let response = self.client.head(self.url.clone()).send().await.with_context(ctx)?;
		if !response.status().is_success() {
			let status = response.status();
			bail!("expected successful HEAD response, got {status}, {}", ctx());
		}
		response
			.content_length()
			.ok_or_else(|| anyhow!("no content-length in HEAD response, {}", ctx()))
	}

	fn get_name(&self) -> &str {
		&self.name
	}
}
