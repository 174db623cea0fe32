use thiserror::Error;

pub const PAY_FOR_PROJECT_PREFIX: &str = "pay_for_project_";
pub const CONFIRM_PROJECT_PREFIX: &str = "confirm_project_";
pub const REQUEST_COMPLETION_DATA: &str = "confirm_project";
pub const DEL_MESSAGE_DATA: &str = "del_message";
pub const CALL_ADMIN_DATA: &str = "call_admin";
pub const OFFER_PRICE_DATA: &str = "offer_price";
pub const FEEDBACK_DATA: &str = "feedback";

/// Telegram limit for `callback_data`, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 64;

const KNOWN_PREFIXES: &[&str] = &[
  PAY_FOR_PROJECT_PREFIX,
  CONFIRM_PROJECT_PREFIX,
  REQUEST_COMPLETION_DATA,
  DEL_MESSAGE_DATA,
  CALL_ADMIN_DATA,
  OFFER_PRICE_DATA,
  FEEDBACK_DATA,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
  #[error("unknown callback payload: {0}")]
  UnknownPrefix(String),
  #[error("malformed operand for {prefix}: {operand:?}")]
  Malformed { prefix: &'static str, operand: String },
  #[error("callback payload is {0} bytes")]
  TooLong(usize),
}

impl CallbackError {
  pub fn user_message(&self) -> &'static str {
    "⚠️ This button is no longer valid."
  }
}

/// Button payload: `<prefix><operand>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
  CallAdmin,
  OfferPrice,
  RequestCompletion,
  Feedback,
  DeleteMessage,
  Pay { price: i64, project_id: String },
  ConfirmProject { project_id: String },
}

impl CallbackData {
  pub fn encode(&self) -> String {
    match self {
      Self::CallAdmin => CALL_ADMIN_DATA.to_string(),
      Self::OfferPrice => OFFER_PRICE_DATA.to_string(),
      Self::RequestCompletion => REQUEST_COMPLETION_DATA.to_string(),
      Self::Feedback => FEEDBACK_DATA.to_string(),
      Self::DeleteMessage => DEL_MESSAGE_DATA.to_string(),
      Self::Pay { price, project_id } => format!("{PAY_FOR_PROJECT_PREFIX}{price}_{project_id}"),
      Self::ConfirmProject { project_id } => format!("{CONFIRM_PROJECT_PREFIX}{project_id}"),
    }
  }

  /// Strips the longest known prefix and parses the remainder as its operand.
  pub fn decode(data: &str) -> Result<Self, CallbackError> {
    let data = data.trim();
    if data.len() > MAX_PAYLOAD_LEN {
      return Err(CallbackError::TooLong(data.len()));
    }
    let prefix = KNOWN_PREFIXES
      .iter()
      .copied()
      .filter(|prefix| data.starts_with(prefix))
      .max_by_key(|prefix| prefix.len())
      .ok_or_else(|| CallbackError::UnknownPrefix(data.to_string()))?;
    let operand = &data[prefix.len() ..];
    let malformed = || CallbackError::Malformed {
      prefix,
      operand: operand.to_string(),
    };

    match prefix {
      PAY_FOR_PROJECT_PREFIX => {
        let (price, project_id) = operand.split_once('_').ok_or_else(malformed)?;
        let price = price.parse::<i64>().map_err(|_| malformed())?;
        if price <= 0 || project_id.is_empty() {
          return Err(malformed());
        }
        Ok(Self::Pay {
          price,
          project_id: project_id.to_string(),
        })
      },
      CONFIRM_PROJECT_PREFIX => {
        if operand.is_empty() {
          return Err(malformed());
        }
        Ok(Self::ConfirmProject {
          project_id: operand.to_string(),
        })
      },
      _ if !operand.is_empty() => Err(malformed()),
      REQUEST_COMPLETION_DATA => Ok(Self::RequestCompletion),
      DEL_MESSAGE_DATA => Ok(Self::DeleteMessage),
      CALL_ADMIN_DATA => Ok(Self::CallAdmin),
      OFFER_PRICE_DATA => Ok(Self::OfferPrice),
      _ => Ok(Self::Feedback),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn payment_payload_carries_price_and_project() {
    let decoded = CallbackData::decode("pay_for_project_500_6f1c1a52-8f8b-4c38-9a2b-0d6d1f7e4a10").unwrap();
    assert_eq!(
      decoded,
      CallbackData::Pay {
        price: 500,
        project_id: "6f1c1a52-8f8b-4c38-9a2b-0d6d1f7e4a10".to_string(),
      }
    );
  }

  #[test]
  fn longest_prefix_wins() {
    assert_eq!(CallbackData::decode("confirm_project").unwrap(), CallbackData::RequestCompletion);
    assert_eq!(
      CallbackData::decode("confirm_project_abc").unwrap(),
      CallbackData::ConfirmProject {
        project_id: "abc".to_string()
      }
    );
  }

  #[test]
  fn encoding_is_decodable() {
    for data in [
      CallbackData::CallAdmin,
      CallbackData::OfferPrice,
      CallbackData::Feedback,
      CallbackData::DeleteMessage,
      CallbackData::Pay {
        price: 10,
        project_id: "p".to_string(),
      },
    ] {
      assert_eq!(CallbackData::decode(&data.encode()).unwrap(), data);
    }
  }

  #[test]
  fn malformed_payloads_are_rejected() {
    assert!(matches!(
      CallbackData::decode("pay_for_project_abc_p"),
      Err(CallbackError::Malformed { .. })
    ));
    assert!(matches!(
      CallbackData::decode("pay_for_project_500"),
      Err(CallbackError::Malformed { .. })
    ));
    assert!(matches!(CallbackData::decode("call_adminx"), Err(CallbackError::Malformed { .. })));
    assert!(matches!(CallbackData::decode("menu:root"), Err(CallbackError::UnknownPrefix(_))));
    let oversized = format!("confirm_project_{}", "x".repeat(MAX_PAYLOAD_LEN));
    assert!(matches!(CallbackData::decode(&oversized), Err(CallbackError::TooLong(_))));
  }
}
