use std::time::SystemTime;

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
	SignableBody, SignableRequest, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use http::HeaderMap;
use secrecy::ExposeSecret;

use crate::llm::AIError;
use crate::types::Credential;

pub const NAME: &str = "aws.bedrock";
pub const SERVICE: &str = "bedrock";

pub fn host(region: &str) -> String {
	format!("bedrock-runtime.{region}.amazonaws.com")
}

/// Unreserved characters stay literal; anything else (notably the `:` in
/// inference-profile ids) is percent-encoded.
const PATH_ENCODE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
	.remove(b'-')
	.remove(b'.')
	.remove(b'_')
	.remove(b'~');

pub fn path(model: &str, streaming: bool) -> String {
	let verb = if streaming {
		"invoke-with-response-stream"
	} else {
		"invoke"
	};
	let model = percent_encoding::utf8_percent_encode(model, PATH_ENCODE);
	format!("/model/{model}/{verb}")
}

/// Messages bodies sent to Bedrock carry the Anthropic version inline and
/// must not carry `model` or `stream` (both live in the URL).
pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

pub fn supports_reasoning(model: &str) -> bool {
	crate::llm::anthropic::supports_reasoning(model)
}

/// SigV4-sign a fully built request; inserts the authorization, date and
/// content hash headers.
pub fn sign_request(
	credential: &Credential,
	method: &str,
	url: &str,
	headers: &mut HeaderMap,
	body: &[u8],
) -> Result<(), AIError> {
	let Credential::Aws {
		access_key_id,
		secret_access_key,
		region,
	} = credential
	else {
		return Err(AIError::MissingField(
			"bedrock channels require aws credentials".into(),
		));
	};
	let identity = Credentials::new(
		access_key_id.clone(),
		secret_access_key.expose_secret().to_string(),
		None,
		None,
		"channel",
	)
	.into();
	let params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
		.identity(&identity)
		.region(region)
		.name(SERVICE)
		.time(SystemTime::now())
		.settings(SigningSettings::default())
		.build()
		.map_err(|e| AIError::Signing(e.to_string()))?
		.into();
	let signable_headers = headers
		.iter()
		.map(|(k, v)| (k.as_str(), std::str::from_utf8(v.as_bytes()).unwrap_or("")));
	let signable = SignableRequest::new(method, url, signable_headers, SignableBody::Bytes(body))
		.map_err(|e| AIError::Signing(e.to_string()))?;
	let (instructions, _signature) = sign(signable, &params)
		.map_err(|e| AIError::Signing(e.to_string()))?
		.into_parts();
	let (new_headers, _params) = instructions.into_parts();
	for header in new_headers {
		let name = http::HeaderName::from_bytes(header.name().as_bytes())
			.map_err(|e| AIError::Signing(e.to_string()))?;
		let mut value = http::HeaderValue::from_str(header.value())
			.map_err(|e| AIError::Signing(e.to_string()))?;
		value.set_sensitive(header.sensitive());
		headers.insert(name, value);
	}
	Ok(())
}
