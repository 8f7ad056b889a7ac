use serde::{Deserialize, Serialize};

pub const BRAND: &str = "TarTrack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Email,
    Sms,
    Both,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::Both => "both",
        }
    }
}

/// Concrete channels a message will actually go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryPlan {
    pub email: bool,
    pub sms: bool,
}

/// Admin override beats the registrant's stored preference, which beats `Both`.
/// SMS is dropped (and email guaranteed) whenever there is no dispatchable phone.
pub fn resolve_delivery(
    admin_override: Option<NotificationChannel>,
    preference: Option<NotificationChannel>,
    has_phone: bool,
) -> DeliveryPlan {
    let requested = admin_override
        .or(preference)
        .unwrap_or(NotificationChannel::Both);

    match requested {
        NotificationChannel::Email => DeliveryPlan { email: true, sms: false },
        NotificationChannel::Both if has_phone => DeliveryPlan { email: true, sms: true },
        NotificationChannel::Sms if has_phone => DeliveryPlan { email: false, sms: true },
        NotificationChannel::Both | NotificationChannel::Sms => {
            DeliveryPlan { email: true, sms: false }
        }
    }
}

/// Canonical international form for SMS dispatch. `None` when the input
/// cannot be turned into something a carrier would accept.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if digits.starts_with("09") && digits.len() == 11 {
        Some(format!("+63{}", &digits[1..]))
    } else if digits.starts_with("63") && digits.len() == 12 {
        Some(format!("+{digits}"))
    } else if trimmed.starts_with('+') && (8..=15).contains(&digits.len()) {
        Some(format!("+{digits}"))
    } else {
        None
    }
}

// --- Templates ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    pub body: String,
}

fn title_case(word: &str) -> String {
    word.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn approval_email(role: &str, email: &str, generated_password: Option<&str>) -> EmailMessage {
    let title = title_case(role);
    let body = match generated_password {
        Some(password) => format!(
            "Dear {title},\n\n\
             Congratulations! Your {role} application has been approved.\n\n\
             Your login credentials:\n\
             Email: {email}\n\
             Password: {password}\n\n\
             IMPORTANT: Please log in and change your password immediately for security.\n\n\
             Download the {BRAND} mobile app and log in with these credentials.\n\n\
             Welcome to {BRAND}!\n\n\
             Best regards,\n{BRAND} Team\n"
        ),
        None => format!(
            "Dear {title},\n\n\
             Congratulations! Your {role} application has been approved.\n\n\
             You can now log in to the {BRAND} mobile app using the credentials you provided during registration.\n\n\
             Welcome to {BRAND}!\n\n\
             Best regards,\n{BRAND} Team\n"
        ),
    };
    EmailMessage {
        subject: format!("{BRAND} - {title} Account Approved"),
        body,
    }
}

pub fn approval_sms(role: &str, email: &str, generated_password: Option<&str>) -> String {
    let title = title_case(role);
    match generated_password {
        Some(password) => format!(
            "{BRAND} - {title} Account Approved!\n\nLogin:\nEmail: {email}\nPassword: {password}\n\n\
             Download {BRAND} app and login. Change password after first login."
        ),
        None => format!(
            "{BRAND} - {title} Account Approved!\n\n\
             Log in to the {BRAND} app with the email {email} and the password you registered with."
        ),
    }
}

pub fn rejection_email(role: &str, reason: &str) -> EmailMessage {
    EmailMessage {
        subject: format!("{BRAND} - {} Application Status", title_case(role)),
        body: format!(
            "Dear Applicant,\n\n\
             Thank you for your interest in joining {BRAND} as a {role}.\n\n\
             After careful review, we regret to inform you that your application has not been approved at this time.\n\n\
             Reason: {reason}\n\n\
             You may reapply in the future.\n\n\
             Best regards,\n{BRAND} Team\n"
        ),
    }
}

pub fn rejection_sms(role: &str, reason: &str) -> String {
    format!(
        "{BRAND} - {} application not approved.\n\nReason: {reason}\n\nYou may reapply in the future.",
        title_case(role)
    )
}

pub fn credentials_reminder_email(role: &str, email: &str) -> EmailMessage {
    EmailMessage {
        subject: format!("{BRAND} - Your Account Details"),
        body: format!(
            "Dear {},\n\n\
             This is a reminder that your {BRAND} account is active.\n\n\
             Email: {email}\n\n\
             Log in with the password you already have. If you have forgotten it, ask an administrator to issue a new one.\n\n\
             Best regards,\n{BRAND} Team\n",
            title_case(role)
        ),
    }
}

pub fn credentials_reminder_sms(email: &str) -> String {
    format!("{BRAND} - Your account ({email}) is active. Log in with your existing password.")
}

pub fn device_verification_email(code: &str, device_info: &str) -> EmailMessage {
    EmailMessage {
        subject: format!("{BRAND} - New Device Login Verification"),
        body: format!(
            "Dear User,\n\n\
             We detected a login attempt from a new device:\n\
             Device: {device_info}\n\n\
             Your verification code is: {code}\n\n\
             This code will expire in 10 minutes.\n\n\
             If this wasn't you, please change your password immediately.\n\n\
             Best regards,\n{BRAND} Team\n"
        ),
    }
}
