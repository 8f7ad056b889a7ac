pub mod approve_registration;
pub mod change_password;
pub mod login;
pub mod refresh_token;
pub mod reject_registration;
pub mod request_account_deletion;
pub mod resend_credentials;
pub mod submit_registration;
pub mod suspend_user;
pub mod verify_device;

pub use approve_registration::ApproveRegistrationHandler;
pub use change_password::ChangePasswordHandler;
pub use login::LoginHandler;
pub use refresh_token::RefreshTokenHandler;
pub use reject_registration::RejectRegistrationHandler;
pub use request_account_deletion::AccountDeletionHandler;
pub use resend_credentials::ResendCredentialsHandler;
pub use submit_registration::SubmitRegistrationHandler;
pub use suspend_user::SuspensionHandler;
pub use verify_device::VerifyDeviceHandler;
