// demos/minimal.rs
// A web server for a single fixed document, plus a POST echo.
use miniweb::{Server, Session};

static CONTENTS: &str = "<HTML><BODY><H1>Welcome to Miniweb</H1></BODY></HTML>";
static POST_CONTENTS: &str = "<HTML><BODY><H1>Post contents</H1></BODY></HTML>";

fn page_index(session: &mut Session) {
    session.response(200);
    session.write(CONTENTS.as_bytes());
}

fn page_post(session: &mut Session) {
    session.response(200);
    println!(
        "User supplied '{}'",
        String::from_utf8_lossy(session.content())
    );
    session.write(POST_CONTENTS.as_bytes());
}

fn main() {
    let mut server = Server::new();
    server.set_port(8080);

    server.register_page("GET", "/", page_index);
    server.register_page("GET", "/index.html", page_index);
    server.register_page("POST", "/post.html", page_post);

    loop {
        server.run(1000);
    }
}
