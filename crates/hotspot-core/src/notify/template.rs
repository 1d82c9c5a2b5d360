// ── Message templates ──
//
// Two passes: spintax groups `{a|b|c}` collapse to one option, then
// `{placeholder}` names are substituted. The option picked for each group
// depends only on the seed and the group's position, so a resend of the
// same event to the same recipient reads identically.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tracing::warn;

use super::NotificationEvent;

/// Stock Indonesian templates, overridable per event.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<NotificationEvent, String>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        use NotificationEvent as E;
        let stock = [
            (
                E::PaymentSuccess,
                "{Halo|Hai} {name}, pembayaran {order_id} {berhasil|sudah kami terima}. Paket {package} aktif hingga {expiry}.",
            ),
            (
                E::DebtSettled,
                "{Halo|Hai} {name}, pelunasan tunggakan {order_id} berhasil. Terima kasih!",
            ),
            (
                E::QuotaLow,
                "{Halo|Hai} {name}, sisa kuota Anda tinggal {remaining_mb} MB. {Segera beli paket|Isi ulang sekarang} agar tetap terhubung.",
            ),
            (
                E::QuotaHabis,
                "{Halo|Hai} {name}, kuota Anda sudah habis. Silakan beli paket baru di portal.",
            ),
            (
                E::ExpirySoon,
                "{Halo|Hai} {name}, masa aktif paket Anda berakhir {expiry}.",
            ),
            (
                E::AutoDebtBlocked,
                "{Halo|Hai} {name}, akses Anda {dibatasi|ditangguhkan} karena tunggakan kuota {debt_mb} MB melewati batas. Lunasi di portal untuk membuka kembali.",
            ),
            (
                E::ManualDebtBlocked,
                "{Halo|Hai} {name}, akses Anda diblokir karena tunggakan {debt_mb} MB belum lunas di akhir bulan.",
            ),
            (
                E::Unblocked,
                "{Halo|Hai} {name}, akses internet Anda sudah {dibuka kembali|aktif lagi}.",
            ),
            (E::AdminAlert, "[hotspot] {message}"),
        ];
        Self {
            templates: stock
                .into_iter()
                .map(|(event, text)| (event, text.to_owned()))
                .collect(),
        }
    }
}

impl TemplateSet {
    /// Replace the template for one event.
    #[must_use]
    pub fn with(mut self, event: NotificationEvent, text: impl Into<String>) -> Self {
        self.templates.insert(event, text.into());
        self
    }

    pub fn get(&self, event: NotificationEvent) -> Option<&str> {
        self.templates.get(&event).map(String::as_str)
    }

    /// Render `event` for `seed` (recipient + event), or `None` when the
    /// event has no template.
    pub fn render(
        &self,
        event: NotificationEvent,
        seed: &str,
        params: &BTreeMap<String, String>,
    ) -> Option<String> {
        let template = self.get(event)?;
        Some(substitute(&resolve_spintax(template, seed), params))
    }
}

/// Collapse every `{a|b|...}` group, innermost first.
pub fn resolve_spintax(text: &str, seed: &str) -> String {
    let mut out = text.to_owned();
    let mut group = 0u64;
    while let Some((start, end)) = innermost_group(&out) {
        let options: Vec<&str> = out[start + 1..end].split('|').collect();
        let pick = options[pick_index(seed, group, options.len())].to_owned();
        out.replace_range(start..=end, &pick);
        group += 1;
    }
    out
}

/// Byte range of the first brace group that contains `|` and no nested
/// braces.
fn innermost_group(text: &str) -> Option<(usize, usize)> {
    let mut open = None;
    for (i, c) in text.char_indices() {
        match c {
            '{' => open = Some(i),
            '}' => {
                if let Some(start) = open.take() {
                    if text[start + 1..i].contains('|') {
                        return Some((start, i));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn pick_index(seed: &str, group: u64, len: usize) -> usize {
    let digest = Sha256::new()
        .chain_update(seed.as_bytes())
        .chain_update(group.to_be_bytes())
        .finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(head);
    usize::try_from(n % u64::try_from(len).unwrap_or(1)).unwrap_or(0)
}

/// Replace `{name}` placeholders. Unknown names stay in place.
pub fn substitute(text: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder(&after[..end]) => {
                let name = &after[..end];
                if let Some(value) = params.get(name) {
                    out.push_str(value);
                } else {
                    warn!(placeholder = name, "template placeholder without value");
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
