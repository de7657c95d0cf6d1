//! Screen content — built-in copy per language, per-tenant overrides,
//! keyboard layouts, and tracking-link construction.

use rust_decimal::Decimal;

use crate::funnel::model::{ContentOverride, DepositProgress, FunnelState, Screen, Tenant};
use crate::telegram::{InlineButton, InlineKeyboard};

/// Everything the gateway needs to put one screen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScreen {
    pub text: String,
    pub keyboard: InlineKeyboard,
    pub photo_file_id: Option<String>,
}

/// Append tracking parameters to an affiliate link, respecting any query
/// string already present: `click_id` carries the correlation id and
/// `tid` the tenant id, which is what the intake expects back on
/// postbacks.
pub fn with_tracking(url: &str, correlation_id: &str, tenant_id: i64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}click_id={correlation_id}&tid={tenant_id}")
}

/// Format a money amount: whole numbers without decimals, otherwise two
/// decimal places.
pub fn format_amount(amount: Decimal) -> String {
    let normalized = amount.normalize();
    if normalized.fract().is_zero() {
        format!("{}", normalized.trunc())
    } else {
        format!("{:.2}", normalized)
    }
}

/// Languages with a full catalog; everything else reads as English.
pub const LANGS: [&str; 4] = ["en", "ru", "hi", "es"];

fn norm_lang(lang: &str) -> &str {
    match lang {
        "ru" | "hi" | "es" => lang,
        _ => "en",
    }
}

/// Built-in copy. Unknown languages fall back to English.
fn builtin(lang: &str, key: &str) -> (&'static str, &'static str, &'static str) {
    // (title, body, primary button text)
    match (norm_lang(lang), key) {
        ("ru", "subscribe") => (
            "Подпишитесь на канал",
            "Чтобы продолжить, подпишитесь на наш канал, затем нажмите «Проверить».",
            "Подписаться",
        ),
        ("hi", "subscribe") => (
            "हमारे चैनल से जुड़ें",
            "जारी रखने के लिए हमारे चैनल से जुड़ें, फिर «जाँचें» दबाएँ।",
            "चैनल से जुड़ें",
        ),
        ("es", "subscribe") => (
            "Únete a nuestro canal",
            "Para continuar, únete a nuestro canal y luego pulsa «Comprobar».",
            "Unirse",
        ),
        (_, "subscribe") => (
            "Join our channel",
            "To continue, join our channel, then tap \u{201c}Check\u{201d}.",
            "Join channel",
        ),
        ("ru", "register") => (
            "Зарегистрируйтесь",
            "Создайте аккаунт по ссылке ниже. Доступ откроется автоматически после регистрации.",
            "Регистрация",
        ),
        ("hi", "register") => (
            "खाता बनाएँ",
            "नीचे दिए लिंक से रजिस्टर करें। रजिस्ट्रेशन की पुष्टि होते ही एक्सेस खुल जाएगा।",
            "रजिस्टर",
        ),
        ("es", "register") => (
            "Crea tu cuenta",
            "Regístrate con el enlace de abajo. El acceso se desbloquea automáticamente al \
             confirmarse tu registro.",
            "Registrarse",
        ),
        (_, "register") => (
            "Create your account",
            "Register through the link below. Access unlocks automatically once your \
             registration is confirmed.",
            "Register",
        ),
        ("ru", "deposit") => (
            "Пополните счёт",
            "Минимальный депозит: ${needed}\nВнесено: ${paid}\nОсталось: ${remaining}",
            "Пополнить",
        ),
        ("hi", "deposit") => (
            "खाते में राशि जोड़ें",
            "न्यूनतम जमा: ${needed}\nअब तक जमा: ${paid}\nबाकी: ${remaining}",
            "जमा करें",
        ),
        ("es", "deposit") => (
            "Recarga tu cuenta",
            "Depósito mínimo: ${needed}\nPagado: ${paid}\nRestante: ${remaining}",
            "Depositar",
        ),
        (_, "deposit") => (
            "Fund your account",
            "Minimum deposit: ${needed}\nPaid so far: ${paid}\nRemaining: ${remaining}",
            "Deposit",
        ),
        ("ru", "platinum") => (
            "Платиновый статус",
            "Поздравляем! Вам открыт платиновый уровень с расширенным доступом.",
            "Открыть",
        ),
        ("hi", "platinum") => (
            "प्लैटिनम अनलॉक",
            "बधाई! अब आपके पास विस्तारित टूलकिट के साथ प्लैटिनम एक्सेस है।",
            "खोलें",
        ),
        ("es", "platinum") => (
            "Nivel platino desbloqueado",
            "¡Felicidades! Ya tienes acceso platino con el kit ampliado.",
            "Abrir",
        ),
        (_, "platinum") => (
            "Platinum unlocked",
            "Congratulations! You now have platinum access with the extended toolkit.",
            "Open",
        ),
        ("ru", "unlocked") => (
            "Доступ открыт",
            "Все условия выполнены. Полный доступ активирован.",
            "В меню",
        ),
        ("hi", "unlocked") => (
            "एक्सेस मिल गया",
            "सभी शर्तें पूरी हुईं। पूर्ण एक्सेस सक्रिय है।",
            "मेनू पर",
        ),
        ("es", "unlocked") => (
            "Acceso concedido",
            "Todos los requisitos están completos. El acceso total está activo.",
            "Al menú",
        ),
        (_, "unlocked") => (
            "Access granted",
            "All requirements are complete. Full access is now active.",
            "To menu",
        ),
        ("ru", "menu") => ("Главное меню", "Выберите раздел:", "Сигналы"),
        ("hi", "menu") => ("मुख्य मेनू", "एक सेक्शन चुनें:", "सिग्नल"),
        ("es", "menu") => ("Menú principal", "Elige una sección:", "Señales"),
        (_, "menu") => ("Main menu", "Choose a section:", "Signals"),
        _ => ("", "", ""),
    }
}

fn label(lang: &str, key: &str) -> &'static str {
    match (norm_lang(lang), key) {
        ("ru", "check") => "Проверить",
        ("hi", "check") => "जाँचें",
        ("es", "check") => "Comprobar",
        (_, "check") => "Check",
        ("ru", "howto") => "Как это работает",
        ("hi", "howto") => "यह कैसे काम करता है",
        ("es", "howto") => "Cómo funciona",
        (_, "howto") => "How it works",
        ("ru", "support") => "Поддержка",
        ("hi", "support") => "सहायता",
        ("es", "support") => "Soporte",
        (_, "support") => "Support",
        ("ru", "lang") => "Язык / Language",
        ("hi", "lang") => "भाषा / Language",
        ("es", "lang") => "Idioma / Language",
        (_, "lang") => "Language",
        _ => "",
    }
}

/// How-it-works body shown from the menu.
pub fn howto_text(lang: &str) -> &'static str {
    match norm_lang(lang) {
        "ru" => {
            "1. Подпишитесь на канал\n2. Зарегистрируйтесь по ссылке\n\
             3. Пополните счёт\n4. Получите доступ к сигналам"
        }
        "hi" => {
            "1. चैनल से जुड़ें\n2. हमारे लिंक से रजिस्टर करें\n\
             3. खाते में राशि जोड़ें\n4. सिग्नल का एक्सेस पाएँ"
        }
        "es" => {
            "1. Únete al canal\n2. Regístrate con nuestro enlace\n\
             3. Recarga tu cuenta\n4. Obtén acceso a las señales"
        }
        _ => {
            "1. Join the channel\n2. Register through our link\n\
             3. Fund your account\n4. Get access to signals"
        }
    }
}

fn interpolate_deposit(body: &str, progress: &DepositProgress) -> String {
    body.replace("{needed}", &format_amount(progress.needed))
        .replace("{paid}", &format_amount(progress.paid))
        .replace("{remaining}", &format_amount(progress.remaining))
}

/// Build the final text + keyboard for a screen, applying any per-tenant
/// content override on top of the built-in copy.
pub fn render_screen(
    tenant: &Tenant,
    state: &FunnelState,
    screen: &Screen,
    ov: Option<&ContentOverride>,
) -> RenderedScreen {
    let lang = state.lang.as_str();
    let (def_title, def_body, def_button) = builtin(lang, screen.key());

    let title = ov
        .and_then(|o| o.title.as_deref())
        .unwrap_or(def_title)
        .to_string();
    let body = ov
        .and_then(|o| o.body.as_deref())
        .unwrap_or(def_body)
        .to_string();
    let button = ov
        .and_then(|o| o.button_text.as_deref())
        .unwrap_or(def_button)
        .to_string();
    let photo_file_id = ov.and_then(|o| o.photo_file_id.clone());

    let body = match screen {
        Screen::Deposit(progress) => interpolate_deposit(&body, progress),
        _ => body,
    };
    let text = format!("<b>{title}</b>\n\n{body}");

    let keyboard = keyboard_for(tenant, state, screen, &button);

    RenderedScreen {
        text,
        keyboard,
        photo_file_id,
    }
}

fn keyboard_for(
    tenant: &Tenant,
    state: &FunnelState,
    screen: &Screen,
    button: &str,
) -> InlineKeyboard {
    let lang = state.lang.as_str();
    let mut kb = InlineKeyboard::new();

    match screen {
        Screen::Subscribe => {
            if let Some(url) = &tenant.gate_channel_url {
                kb = kb.row(vec![InlineButton::url(button, url)]);
            }
            kb = kb.row(vec![InlineButton::callback(label(lang, "check"), "check_sub")]);
        }
        Screen::Register => {
            if let Some(link) = &tenant.ref_link {
                let url = with_tracking(link, &state.correlation_id, tenant.id);
                kb = kb.row(vec![InlineButton::url(button, url)]);
            }
        }
        Screen::Deposit(_) => {
            let link = tenant.deposit_link.as_ref().or(tenant.ref_link.as_ref());
            if let Some(link) = link {
                let url = with_tracking(link, &state.correlation_id, tenant.id);
                kb = kb.row(vec![InlineButton::url(button, url)]);
            }
        }
        Screen::PlatinumWelcome | Screen::Unlocked => {
            kb = kb.row(vec![InlineButton::callback(button, "menu")]);
        }
        Screen::Menu => {
            let app_url = if state.platinum_tier {
                tenant
                    .platinum_miniapp_url
                    .as_ref()
                    .or(tenant.miniapp_url.as_ref())
            } else {
                tenant.miniapp_url.as_ref()
            };
            if let Some(url) = app_url {
                kb = kb.row(vec![InlineButton::web_app(button, url)]);
            } else {
                kb = kb.row(vec![InlineButton::callback(button, "signal")]);
            }
            kb = kb.row(vec![InlineButton::callback(label(lang, "howto"), "howto")]);
            if let Some(url) = &tenant.support_url {
                kb = kb.row(vec![InlineButton::url(label(lang, "support"), url)]);
            }
            kb = kb.row(vec![InlineButton::callback(label(lang, "lang"), "lang")]);
        }
    }
    kb
}
