use super::*;

/// Client of the payment node.
#[derive(Debug, Clone)]
pub struct PaymentClient {
    remote: Remote,
}

impl PaymentClient {
    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Ask for a verification email to be sent.
    pub async fn get_verification_email(
        &self,
        req: &GetVerificationEmailRequest,
    ) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(method::PAYMENT_GET_VERIFICATION_EMAIL, req)
            .await?;
        Ok(())
    }

    /// Confirm the code from the verification email.
    pub async fn verify_email_code(&self, code: impl Into<String>) -> HeartResult<()> {
        let _: Empty = self
            .remote
            .call(
                method::PAYMENT_VERIFY_EMAIL_CODE,
                &VerifyEmailCodeRequest { code: code.into() },
            )
            .await?;
        Ok(())
    }

    pub(crate) fn mode(&self) -> NetworkMode {
        self.remote.mode
    }
}
