use serde::Deserialize;

use crate::{string_or_number, ProviderStatus};

/// Body the provider POSTs to the callback URL once a push settles.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub result_code: String,
    #[serde(default)]
    pub result_desc: String,
    #[serde(default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

impl CallbackEnvelope {
    pub fn checkout_request_id(&self) -> &str {
        &self.body.stk_callback.checkout_request_id
    }

    pub fn status(&self) -> ProviderStatus {
        self.body.stk_callback.status()
    }
}

impl StkCallback {
    pub fn metadata(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    pub fn status(&self) -> ProviderStatus {
        match ProviderStatus::from_result_code(&self.result_code, &self.result_desc) {
            ProviderStatus::Completed { .. } => ProviderStatus::Completed {
                receipt_number: self
                    .metadata("MpesaReceiptNumber")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
            other => other,
        }
    }
}
