use salvo::prelude::*;

pub const ALIVE_BODY: &str = "Bot actif";

/// Uptime check; reads no tracker state.
#[handler]
pub async fn alive(res: &mut Response) {
    res.render(Text::Plain(ALIVE_BODY));
}
