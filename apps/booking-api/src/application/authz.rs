use super::ApplicationError;
use super::middleware::AuthenticatedUser;
use core_lib::domain::user::UserRole;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum Requirement {
    AdminOnly,
    SelfOrAdmin { target_user_id: Uuid },
}

pub fn authorize(ctx: &AuthenticatedUser, req: Requirement) -> Result<(), ApplicationError> {
    if ctx.role == UserRole::Admin {
        return Ok(());
    }
    match req {
        Requirement::AdminOnly => Err(ApplicationError::forbidden(
            "Administrator access is required",
        )),
        Requirement::SelfOrAdmin { target_user_id } => {
            if target_user_id == ctx.user_id {
                Ok(())
            } else {
                Err(ApplicationError::forbidden(
                    "You can only access your own account",
                ))
            }
        }
    }
}
