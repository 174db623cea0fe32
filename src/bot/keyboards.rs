use crate::bot::callback::CallbackData;
use crate::models::ChannelRole;
use crate::session::Action;
use crate::session::Phase;
use crate::transport::Button;
use crate::transport::Keyboard;

/// Menu actions in display order.
const MENU: [(Action, &str, CallbackData); 3] = [
  (Action::OfferPrice, "💰 Offer price", CallbackData::OfferPrice),
  (Action::RequestCompletion, "✅ Confirm completion", CallbackData::RequestCompletion),
  (Action::LeaveReview, "⭐ Leave review", CallbackData::Feedback),
];

fn button(label: &str, data: CallbackData) -> Button {
  Button::new(label, data.encode())
}

/// Session menu for one side of a pair. Offers exactly the actions the
/// session guards would accept in this phase, plus the admin call.
pub fn session_keyboard(role: ChannelRole, phase: Phase) -> Keyboard {
  let mut buttons: Vec<Button> = MENU
    .into_iter()
    .filter(|(action, _, _)| action.actor() == role && action.allows(phase))
    .map(|(_, label, data)| button(label, data))
    .collect();
  buttons.push(button("🆘 Call admin", CallbackData::CallAdmin));
  Keyboard::single_column(buttons)
}

pub fn pay_keyboard(price: i64, project_id: &str) -> Keyboard {
  Keyboard::single_column(vec![
    button(
      "💳 Pay",
      CallbackData::Pay {
        price,
        project_id: project_id.to_string(),
      },
    ),
    button("❌ Decline", CallbackData::DeleteMessage),
  ])
}

pub fn confirm_keyboard(project_id: &str) -> Keyboard {
  Keyboard::single_column(vec![
    button(
      "✅ Yes, confirm",
      CallbackData::ConfirmProject {
        project_id: project_id.to_string(),
      },
    ),
    button("❌ Not yet", CallbackData::DeleteMessage),
  ])
}

pub fn cancel_keyboard() -> Keyboard {
  Keyboard::single_column(vec![button("❌ Cancel", CallbackData::DeleteMessage)])
}
